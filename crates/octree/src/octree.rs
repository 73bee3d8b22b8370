use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::hash::Hash;

use strata_common::{AACube, Frustum, Plane, Sphere};

use crate::filter::FilterSet;

pub type NodeId = u64;

pub const DEFAULT_HALF_MIN_RESOLUTION: f64 = 1.0;
pub const DEFAULT_MAX_OBJECTS: usize = 5;
pub const DEFAULT_MIN_OBJECTS: usize = 2;

#[derive(Debug)]
struct OctreeNode<K> {
    cube: AACube,
    parent: Option<NodeId>,
    children: Option<[NodeId; 8]>,
    objects: Vec<K>,
}

#[derive(Debug, Clone, Copy)]
struct OctreeObject {
    node: NodeId,
    sphere: Sphere,
}

/// Adaptive octree over objects identified by `K` with a bounding sphere.
///
/// Leaves split when they hold more than `max_objects` and are still larger
/// than the minimum resolution; sibling leaves merge back into their parent
/// once they hold `min_objects` or fewer in total. An object descends only
/// into children whose half edge is at least its radius, so large objects
/// stay at inner nodes and every object lies within twice its node's box.
///
/// Node ids are handed out monotonically and nodes live in a `BTreeMap`, so
/// identical operation sequences produce identical trees and query order.
pub struct Octree<K> {
    nodes: BTreeMap<NodeId, OctreeNode<K>>,
    objects: HashMap<K, OctreeObject>,
    root: NodeId,
    next_node: NodeId,
    half_min_resolution: f64,
    max_objects: usize,
    min_objects: usize,
    filters: FilterSet,
    result: Vec<K>,
}

impl<K: Copy + Eq + Hash + Debug> Octree<K> {
    pub fn new(root: AACube, half_min_resolution: f64, max_objects: usize, min_objects: usize) -> Self {
        assert!(
            max_objects > min_objects,
            "max_objects ({max_objects}) must exceed min_objects ({min_objects})"
        );
        assert!(half_min_resolution > 0.0, "half_min_resolution must be positive");
        assert!(
            root.half_edge > half_min_resolution,
            "root half edge {} must exceed half_min_resolution {half_min_resolution}",
            root.half_edge
        );

        let mut tree = Self {
            nodes: BTreeMap::new(),
            objects: HashMap::new(),
            root: 0,
            next_node: 0,
            half_min_resolution,
            max_objects,
            min_objects,
            filters: FilterSet::default(),
            result: Vec::new(),
        };
        tree.root = tree.create_node(root, None);
        tree
    }

    pub fn with_defaults(root: AACube) -> Self {
        Self::new(
            root,
            DEFAULT_HALF_MIN_RESOLUTION,
            DEFAULT_MAX_OBJECTS,
            DEFAULT_MIN_OBJECTS,
        )
    }

    /// Register `id` with its bounding sphere. Panics if the id is already
    /// present or the center lies outside the root cube.
    pub fn insert(&mut self, id: K, sphere: Sphere) {
        assert!(!self.objects.contains_key(&id), "object {id:?} already in octree");
        assert!(
            self.root_cube().contains_point(sphere.center),
            "object {id:?} at {} outside octree root",
            sphere.center
        );

        let node_id = self.descend(self.root, &sphere);
        self.objects.insert(id, OctreeObject { node: node_id, sphere });
        self.node_mut(node_id).objects.push(id);
        self.try_split(node_id);
    }

    /// Unregister `id`, merging emptied branches. Panics on unknown ids.
    pub fn remove(&mut self, id: K) {
        let Some(object) = self.objects.remove(&id) else {
            panic!("object {id:?} is not in the octree");
        };

        let node = self.node_mut(object.node);
        node.objects.retain(|o| *o != id);
        let mut next = if node.children.is_some() {
            Some(object.node)
        } else {
            node.parent
        };

        while let Some(node_id) = next {
            if !self.try_merge(node_id) {
                break;
            }
            next = self.nodes[&node_id].parent;
        }
    }

    /// Store a new sphere for `id`. The object is relocated when its center
    /// left its node or it grew past the node's half edge; unknown ids are
    /// inserted.
    pub fn update(&mut self, id: K, sphere: Sphere) {
        let Some(object) = self.objects.get_mut(&id) else {
            self.insert(id, sphere);
            return;
        };
        if object.sphere == sphere {
            return;
        }
        object.sphere = sphere;
        let node = object.node;

        let cube = self.nodes[&node].cube;
        let fits = cube.contains_point(sphere.center)
            && (node == self.root || sphere.radius <= cube.half_edge);
        if !fits {
            self.remove(id);
            self.insert(id, sphere);
        }
    }

    pub fn add_frustum_filter(&mut self, frustum: Frustum) {
        self.filters.add_frustum(frustum);
    }

    pub fn add_plane_filter(&mut self, plane: Plane) {
        self.filters.add_plane(plane);
    }

    pub fn add_sphere_filter(&mut self, sphere: Sphere) {
        self.filters.add_sphere(sphere);
    }

    /// Drop all filters and the last result.
    pub fn clear_filter(&mut self) {
        self.filters.clear();
        self.result.clear();
    }

    /// Collect every object passing all active filters into the result list.
    pub fn filter(&mut self) {
        let mut result = std::mem::take(&mut self.result);
        result.clear();
        self.filter_node(self.root, &mut result);
        self.result = result;
    }

    pub fn result(&self) -> &[K] {
        &self.result
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, id: K) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn sphere(&self, id: K) -> Option<Sphere> {
        self.objects.get(&id).map(|o| o.sphere)
    }

    pub fn root_cube(&self) -> AACube {
        self.nodes[&self.root].cube
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn leaf_count(&self) -> usize {
        self.nodes.values().filter(|n| n.children.is_none()).count()
    }

    /// Number of levels; a tree that never split has depth 1.
    pub fn depth(&self) -> usize {
        let mut stack = vec![(self.root, 1)];
        let mut depth = 0;
        while let Some((id, level)) = stack.pop() {
            depth = depth.max(level);
            if let Some(children) = self.nodes[&id].children {
                stack.extend(children.iter().map(|c| (*c, level + 1)));
            }
        }
        depth
    }

    /// Boxes of all nodes in id order, for debug drawing.
    pub fn node_boxes(&self) -> Vec<AACube> {
        self.nodes.values().map(|n| n.cube).collect()
    }

    fn create_node(&mut self, cube: AACube, parent: Option<NodeId>) -> NodeId {
        let id = self.next_node;
        self.next_node += 1;
        self.nodes.insert(
            id,
            OctreeNode {
                cube,
                parent,
                children: None,
                objects: Vec::new(),
            },
        );
        id
    }

    fn node_mut(&mut self, id: NodeId) -> &mut OctreeNode<K> {
        self.nodes
            .get_mut(&id)
            .unwrap_or_else(|| panic!("octree node {id} missing"))
    }

    // deepest node below `start` whose children are too small for the sphere
    fn descend(&self, start: NodeId, sphere: &Sphere) -> NodeId {
        let mut current = start;
        loop {
            let node = &self.nodes[&current];
            let Some(children) = node.children else {
                return current;
            };
            if sphere.radius > node.cube.half_edge * 0.5 {
                return current;
            }
            current = children[node.cube.octant_of(sphere.center)];
        }
    }

    fn try_split(&mut self, node_id: NodeId) {
        let node = &self.nodes[&node_id];
        if node.children.is_none()
            && node.objects.len() > self.max_objects
            && node.cube.half_edge > self.half_min_resolution
        {
            self.split(node_id);
        }
    }

    fn split(&mut self, node_id: NodeId) {
        let cube = self.nodes[&node_id].cube;
        let children: [NodeId; 8] =
            std::array::from_fn(|i| self.create_node(cube.octant(i), Some(node_id)));

        let objects = std::mem::take(&mut self.node_mut(node_id).objects);
        let mut kept = Vec::new();
        for id in objects {
            let sphere = self.objects[&id].sphere;
            let index = cube.octant_of(sphere.center);
            let child_cube = cube.octant(index);
            if sphere.radius > child_cube.half_edge || !child_cube.contains_point(sphere.center) {
                kept.push(id);
                continue;
            }
            let child = children[index];
            self.node_mut(child).objects.push(id);
            if let Some(object) = self.objects.get_mut(&id) {
                object.node = child;
            }
        }

        if !kept.is_empty() {
            tracing::warn!(
                node = node_id,
                kept = kept.len(),
                half_edge = cube.half_edge,
                "objects straddle child boundaries, kept at parent"
            );
        }
        tracing::trace!(node = node_id, half_edge = cube.half_edge, "octree node split");

        let node = self.node_mut(node_id);
        node.objects = kept;
        node.children = Some(children);

        for child in children {
            self.try_split(child);
        }
    }

    fn try_merge(&mut self, node_id: NodeId) -> bool {
        let Some(children) = self.nodes[&node_id].children else {
            return false;
        };

        let mut count = 0;
        for child in &children {
            let child = &self.nodes[child];
            if child.children.is_some() {
                return false;
            }
            count += child.objects.len();
        }
        if count > self.min_objects {
            return false;
        }

        for child in children {
            let Some(child) = self.nodes.remove(&child) else {
                continue;
            };
            for id in child.objects {
                if let Some(object) = self.objects.get_mut(&id) {
                    object.node = node_id;
                }
                self.node_mut(node_id).objects.push(id);
            }
        }
        self.node_mut(node_id).children = None;
        tracing::trace!(node = node_id, "octree node merged");
        true
    }

    fn filter_node(&self, node_id: NodeId, out: &mut Vec<K>) {
        let node = &self.nodes[&node_id];
        // objects reach up to twice their node's box; the root holds anything
        let loose = AACube::new(node.cube.center, node.cube.half_edge * 2.0);
        if node_id != self.root && !self.filters.passes_cube(&loose) {
            return;
        }

        for id in &node.objects {
            if self.filters.passes_sphere(&self.objects[id].sphere) {
                out.push(*id);
            }
        }
        if let Some(children) = node.children {
            for child in children {
                self.filter_node(child, out);
            }
        }
    }
}
