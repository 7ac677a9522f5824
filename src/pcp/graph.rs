use super::layer_stack::LayerStack;
use super::map_expression::MapExpression;
use super::{ArcType, LayerStackSite};
use crate::sdf;
use std::sync::Arc;

// Index used to represent an invalid node.
pub const INVALID_NODE_INDEX: u16 = u16::MAX;

#[derive(Debug, Clone)]
pub struct Node {
	pub layer_stack: Arc<LayerStack>,

	pub parent_index: u16,
	pub origin_index: u16,

	// The indices of the first/last child, previous/next sibling.
	// The previous sibling index of a first child and the next
	// sibling index of a last child are `INVALID_NODE_INDEX`
	// (i.e. they form a list, not a ring).
	pub first_child_index: u16,
	pub last_child_index: u16,
	pub prev_sibling_index: u16,
	pub next_sibling_index: u16,

	pub arc_type: ArcType,
	pub map_to_parent: MapExpression,

	/// The number of non-variant components of the parent node's path at
	/// the moment this arc was added. Distinguishes direct arcs from arcs
	/// introduced by a namespace ancestor.
	pub namespace_depth: u16,
	/// Index of this arc in the list of arcs authored at its origin.
	/// Stable tie-break for equal-strength siblings.
	pub sibling_num_at_origin: u16,

	pub permission: sdf::Permission,
	/// Inert nodes are kept for dependency tracking but contribute no
	/// opinions.
	pub inert: bool,
	/// Culled nodes are physically removed from the graph at finalize.
	pub culled: bool,
	/// Set when permission enforcement finds a stronger opinion over a
	/// private site.
	pub restricted: bool,
	pub has_specs: bool,
	pub has_symmetry: bool,
	pub is_due_to_ancestor: bool,
}

impl Node {
	pub fn new(
		layer_stack: Arc<LayerStack>,
		parent_index: u16,
		origin_index: u16,
		arc_type: ArcType,
		map_to_parent: MapExpression,
	) -> Self {
		Self {
			layer_stack,
			parent_index,
			origin_index,
			first_child_index: INVALID_NODE_INDEX,
			last_child_index: INVALID_NODE_INDEX,
			prev_sibling_index: INVALID_NODE_INDEX,
			next_sibling_index: INVALID_NODE_INDEX,
			arc_type,
			map_to_parent,
			namespace_depth: 0,
			sibling_num_at_origin: 0,
			permission: sdf::Permission::Public,
			inert: false,
			culled: false,
			restricted: false,
			has_specs: false,
			has_symmetry: false,
			is_due_to_ancestor: false,
		}
	}

	/// Whether opinions at this node's site may contribute to the composed
	/// result.
	pub fn can_contribute_specs(&self) -> bool {
		!self.inert && !self.restricted
	}
}

#[derive(Debug, Clone)]
pub struct UnsharedData {
	pub site_path: sdf::Path,
}

#[derive(Debug, Clone, Default)]
pub struct PrimIndexGraph {
	pub nodes: Vec<Node>,
	pub unshared: Vec<UnsharedData>,
	pub has_payloads: bool,
	pub instanceable: bool,
}

impl PrimIndexGraph {
	pub fn new() -> Self {
		Self::default()
	}

	/// Whether the node pool has reached its index capacity.
	pub fn is_full(&self) -> bool {
		self.nodes.len() + 1 >= INVALID_NODE_INDEX as usize
	}

	pub fn add_node(&mut self, node: Node, site_path: sdf::Path) -> u16 {
		let index = self.nodes.len();
		self.nodes.push(node);
		self.unshared.push(UnsharedData { site_path });
		index as u16
	}

	pub fn get_node(&self, index: u16) -> Option<&Node> {
		if index == INVALID_NODE_INDEX {
			None
		} else {
			self.nodes.get(index as usize)
		}
	}

	pub fn get_node_mut(&mut self, index: u16) -> Option<&mut Node> {
		if index == INVALID_NODE_INDEX {
			None
		} else {
			self.nodes.get_mut(index as usize)
		}
	}

	pub fn get_unshared(&self, index: u16) -> Option<&UnsharedData> {
		if index == INVALID_NODE_INDEX {
			None
		} else {
			self.unshared.get(index as usize)
		}
	}

	pub fn node_site(&self, index: u16) -> LayerStackSite {
		LayerStackSite {
			layer_stack: self.nodes[index as usize].layer_stack.clone(),
			path: self.unshared[index as usize].site_path.clone(),
		}
	}

	/// The indices of `parent`'s children, strongest first.
	pub fn children(&self, parent: u16) -> Vec<u16> {
		let mut indices = Vec::new();
		if let Some(node) = self.get_node(parent) {
			let mut current = node.first_child_index;
			while current != INVALID_NODE_INDEX {
				indices.push(current);
				current = self.nodes[current as usize].next_sibling_index;
			}
		}
		indices
	}

	/// Find a node at the given site, if one exists.
	pub fn node_using_site(&self, site: &LayerStackSite) -> Option<u16> {
		(0..self.nodes.len() as u16).find(|&i| {
			Arc::ptr_eq(&self.nodes[i as usize].layer_stack, &site.layer_stack)
				&& self.unshared[i as usize].site_path == site.path
		})
	}

	pub fn add_child(&mut self, parent_idx: u16, node: Node, site_path: sdf::Path) -> u16 {
		let child_idx = self.add_node(node, site_path);
		self.link_child(parent_idx, child_idx);
		child_idx
	}

	// Insert child in strength order among its siblings: arc type rank
	// first, then sibling number at origin; insertion order breaks the
	// remaining ties (new nodes go after existing equals).
	fn link_child(&mut self, parent_idx: u16, child_idx: u16) {
		self.nodes[child_idx as usize].parent_index = parent_idx;

		let arc_type = self.nodes[child_idx as usize].arc_type;
		let sibling_num = self.nodes[child_idx as usize].sibling_num_at_origin;

		let mut insert_after = INVALID_NODE_INDEX;
		let mut current = self.nodes[parent_idx as usize].first_child_index;

		while current != INVALID_NODE_INDEX {
			let current_node = &self.nodes[current as usize];
			let stronger = match arc_strength(arc_type).cmp(&arc_strength(current_node.arc_type)) {
				std::cmp::Ordering::Less => true,
				std::cmp::Ordering::Greater => false,
				std::cmp::Ordering::Equal => sibling_num < current_node.sibling_num_at_origin,
			};
			if stronger {
				break;
			}
			insert_after = current;
			current = self.nodes[current as usize].next_sibling_index;
		}

		if insert_after == INVALID_NODE_INDEX {
			let old_first = self.nodes[parent_idx as usize].first_child_index;
			self.nodes[parent_idx as usize].first_child_index = child_idx;
			if old_first != INVALID_NODE_INDEX {
				self.nodes[old_first as usize].prev_sibling_index = child_idx;
				self.nodes[child_idx as usize].next_sibling_index = old_first;
			} else {
				self.nodes[parent_idx as usize].last_child_index = child_idx;
			}
		} else {
			let next = self.nodes[insert_after as usize].next_sibling_index;
			self.nodes[insert_after as usize].next_sibling_index = child_idx;
			self.nodes[child_idx as usize].prev_sibling_index = insert_after;
			self.nodes[child_idx as usize].next_sibling_index = next;
			if next != INVALID_NODE_INDEX {
				self.nodes[next as usize].prev_sibling_index = child_idx;
			} else {
				self.nodes[parent_idx as usize].last_child_index = child_idx;
			}
		}
	}

	/// Graft `subgraph` beneath `parent_idx`. The subgraph's root becomes a
	/// child of `parent_idx` carrying the given arc attributes; every other
	/// node keeps its relations, re-indexed into this graph's pool.
	#[allow(clippy::too_many_arguments)]
	pub fn insert_child_subgraph(
		&mut self,
		parent_idx: u16,
		subgraph: PrimIndexGraph,
		origin_idx: u16,
		arc_type: ArcType,
		map_to_parent: MapExpression,
		namespace_depth: u16,
		sibling_num_at_origin: u16,
	) -> u16 {
		let offset = self.nodes.len() as u16;
		let remap = |index: u16| {
			if index == INVALID_NODE_INDEX {
				INVALID_NODE_INDEX
			} else {
				index + offset
			}
		};

		for (local_idx, (mut node, unshared)) in subgraph
			.nodes
			.into_iter()
			.zip(subgraph.unshared)
			.enumerate()
		{
			node.parent_index = remap(node.parent_index);
			node.origin_index = remap(node.origin_index);
			node.first_child_index = remap(node.first_child_index);
			node.last_child_index = remap(node.last_child_index);
			node.prev_sibling_index = remap(node.prev_sibling_index);
			node.next_sibling_index = remap(node.next_sibling_index);

			if local_idx == 0 {
				node.origin_index = origin_idx;
				node.arc_type = arc_type;
				node.map_to_parent = map_to_parent.clone();
				node.namespace_depth = namespace_depth;
				node.sibling_num_at_origin = sibling_num_at_origin;
			}

			self.add_node(node, unshared.site_path);
		}

		if subgraph.has_payloads {
			self.has_payloads = true;
		}

		self.link_child(parent_idx, offset);
		offset
	}
}

/// Strength ordering.
impl PrimIndexGraph {
	/// Compare the strength of two nodes within this graph.
	/// `Less` means `a` is stronger than `b`.
	pub fn compare_node_strength(&self, a: u16, b: u16) -> std::cmp::Ordering {
		use std::cmp::Ordering;

		if a == b {
			return Ordering::Equal;
		}

		let chain_a = self.chain_from_root(a);
		let chain_b = self.chain_from_root(b);

		let common = chain_a
			.iter()
			.zip(&chain_b)
			.take_while(|(x, y)| x == y)
			.count();

		// A node is stronger than every node in the subtree below it.
		if common == chain_a.len() {
			return Ordering::Less;
		}
		if common == chain_b.len() {
			return Ordering::Greater;
		}

		let child_a = &self.nodes[chain_a[common] as usize];
		let child_b = &self.nodes[chain_b[common] as usize];
		arc_strength(child_a.arc_type)
			.cmp(&arc_strength(child_b.arc_type))
			.then(child_a.sibling_num_at_origin.cmp(&child_b.sibling_num_at_origin))
			.then(chain_a[common].cmp(&chain_b[common]))
	}

	fn chain_from_root(&self, node: u16) -> Vec<u16> {
		let mut chain = Vec::new();
		let mut current = node;
		while current != INVALID_NODE_INDEX {
			chain.push(current);
			current = self.nodes[current as usize].parent_index;
		}
		chain.reverse();
		chain
	}

	/// All node indices in strength order (strongest first): a depth-first
	/// walk visiting each parent before its children.
	pub fn nodes_in_strength_order(&self) -> Vec<u16> {
		let mut order = Vec::with_capacity(self.nodes.len());
		if self.nodes.is_empty() {
			return order;
		}

		let mut stack = vec![0u16];
		while let Some(index) = stack.pop() {
			order.push(index);
			let children = self.children(index);
			for &child in children.iter().rev() {
				stack.push(child);
			}
		}
		order
	}
}

/// Node attribute queries that need graph context.
impl PrimIndexGraph {
	/// How many levels of namespace below its introduction point this node
	/// now sits. Zero means this node is where the arc was authored.
	pub fn depth_below_introduction(&self, index: u16) -> u16 {
		let node = &self.nodes[index as usize];
		if node.parent_index == INVALID_NODE_INDEX {
			return 0;
		}

		let parent_path = &self.unshared[node.parent_index as usize].site_path;
		(parent_path.non_variant_element_count() as u16).saturating_sub(node.namespace_depth)
	}

	/// The node's site path at the time its arc was introduced.
	pub fn path_at_introduction(&self, index: u16) -> sdf::Path {
		let mut path = self.unshared[index as usize].site_path.clone();
		for _ in 0..self.depth_below_introduction(index) {
			while path.is_prim_variant_selection_path() {
				path = path.parent_path();
			}
			path = path.parent_path();
		}
		path
	}

	/// The composed mapping from this node's namespace to the graph root's.
	pub fn map_to_root(&self, index: u16) -> MapExpression {
		let mut expr = MapExpression::identity();
		let mut current = index;
		while current != INVALID_NODE_INDEX {
			let node = &self.nodes[current as usize];
			if node.parent_index == INVALID_NODE_INDEX {
				break;
			}
			expr = node.map_to_parent.compose(&expr);
			current = node.parent_index;
		}
		expr
	}

	/// Walk the origin chain to the node that originally introduced this
	/// arc.
	pub fn origin_root(&self, index: u16) -> u16 {
		let mut current = index;
		loop {
			let node = &self.nodes[current as usize];
			if node.origin_index == INVALID_NODE_INDEX
				|| node.origin_index == node.parent_index
				|| node.origin_index == current
			{
				return current;
			}
			current = node.origin_index;
		}
	}

	pub fn is_node_in_subtree(&self, node: u16, subtree_root: u16) -> bool {
		let mut current = node;
		while current != INVALID_NODE_INDEX {
			if current == subtree_root {
				return true;
			}
			current = self.nodes[current as usize].parent_index;
		}
		false
	}
}

/// Construction-time graph rewrites.
impl PrimIndexGraph {
	/// Rebase every node's site path one namespace level deeper by
	/// appending the name of `child_path`. Used when deriving a child's
	/// initial graph from its parent's.
	pub fn append_child_name_to_all_sites(&mut self, child_path: &sdf::Path) {
		let name = child_path.name_token();
		for unshared in &mut self.unshared {
			unshared.site_path = unshared.site_path.append_child(&name);
		}
	}

	/// Physically remove culled nodes and compact the pool. Surviving nodes
	/// are renumbered in strength order; relative sibling order is kept.
	pub fn finalize(&mut self) {
		if self.nodes.is_empty() {
			return;
		}

		let kept: Vec<u16> = self
			.nodes_in_strength_order()
			.into_iter()
			.filter(|&i| !self.nodes[i as usize].culled)
			.collect();

		if kept.len() == self.nodes.len() {
			return;
		}

		let mut remap = vec![INVALID_NODE_INDEX; self.nodes.len()];
		for (new_idx, &old_idx) in kept.iter().enumerate() {
			remap[old_idx as usize] = new_idx as u16;
		}

		// Origins may point at culled nodes; fall back to the nearest
		// surviving ancestor of the origin.
		let surviving_origin = |mut origin: u16| -> u16 {
			while origin != INVALID_NODE_INDEX && remap[origin as usize] == INVALID_NODE_INDEX {
				origin = self.nodes[origin as usize].parent_index;
			}
			if origin == INVALID_NODE_INDEX {
				INVALID_NODE_INDEX
			} else {
				remap[origin as usize]
			}
		};

		let mut nodes = Vec::with_capacity(kept.len());
		let mut unshared = Vec::with_capacity(kept.len());
		for &old_idx in &kept {
			let mut node = self.nodes[old_idx as usize].clone();
			node.parent_index = if node.parent_index == INVALID_NODE_INDEX {
				INVALID_NODE_INDEX
			} else {
				remap[node.parent_index as usize]
			};
			node.origin_index = surviving_origin(node.origin_index);
			node.first_child_index = INVALID_NODE_INDEX;
			node.last_child_index = INVALID_NODE_INDEX;
			node.prev_sibling_index = INVALID_NODE_INDEX;
			node.next_sibling_index = INVALID_NODE_INDEX;
			nodes.push(node);
			unshared.push(self.unshared[old_idx as usize].clone());
		}

		self.nodes = nodes;
		self.unshared = unshared;

		// Relink children. The kept list is in strength order, so appending
		// each node to its parent's list reproduces the original sibling
		// order.
		for index in 1..self.nodes.len() as u16 {
			let parent = self.nodes[index as usize].parent_index;
			let last = self.nodes[parent as usize].last_child_index;
			if last == INVALID_NODE_INDEX {
				self.nodes[parent as usize].first_child_index = index;
			} else {
				self.nodes[last as usize].next_sibling_index = index;
				self.nodes[index as usize].prev_sibling_index = last;
			}
			self.nodes[parent as usize].last_child_index = index;
		}
	}
}

/// Returns the strength rank for a given arc type (lower = stronger).
/// Specializes rank weakest so that subtrees propagated to the root land
/// after every other arc in strength order.
fn arc_strength(arc: ArcType) -> u8 {
	match arc {
		ArcType::Root => 0,
		ArcType::Relocate => 1,
		ArcType::Inherit => 2,
		ArcType::Variant => 3,
		ArcType::Reference => 4,
		ArcType::Payload => 5,
		ArcType::Specialize => 6,
	}
}
