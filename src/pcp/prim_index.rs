use super::cache::PcpCache;
use super::composer;
use super::error::{CapacityFlags, PcpError};
use super::graph::PrimIndexGraph;
use super::indexer;
use super::{LayerStack, LayerStackSite};
use crate::{
	sdf::{self, FIELD_KEYS},
	tf,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// An index of all the sites of scene description that contribute
/// opinions to a specific prim, under composition semantics.
///
/// A prim index is built once by [`compute_prim_index`] and immutable
/// afterwards.
#[derive(Debug, Default)]
pub struct PrimIndex {
	pub graph: PrimIndexGraph,
	pub(crate) prim_stack: Vec<(u16, Arc<sdf::Layer>)>,
	pub(crate) local_errors: Vec<PcpError>,
	pub(crate) usd: bool,
}

impl PrimIndex {
	pub fn is_valid(&self) -> bool {
		!self.graph.nodes.is_empty()
	}

	pub fn root_node(&self) -> u16 {
		0
	}

	/// The path this index was computed for.
	pub fn path(&self) -> sdf::Path {
		self.graph
			.get_unshared(0)
			.map(|unshared| unshared.site_path.clone())
			.unwrap_or_default()
	}

	pub fn has_specs(&self) -> bool {
		self.graph.nodes.iter().any(|node| node.has_specs)
	}

	pub fn has_payloads(&self) -> bool {
		self.graph.has_payloads
	}

	pub fn is_instanceable(&self) -> bool {
		self.graph.instanceable
	}

	/// The `(node, layer)` pairs that actually carry specs for this prim,
	/// strongest first. Empty in USD mode, which does not retain prim
	/// stacks.
	pub fn prim_stack(&self) -> &[(u16, Arc<sdf::Layer>)] {
		&self.prim_stack
	}

	/// Errors encountered while building this index.
	pub fn local_errors(&self) -> &[PcpError] {
		&self.local_errors
	}

	/// All node indices in strength order, strongest first.
	pub fn nodes_in_strength_order(&self) -> Vec<u16> {
		self.graph.nodes_in_strength_order()
	}

	/// The site sequence of the index in strength order. Convenient for
	/// inspecting composition results.
	pub fn sites_in_strength_order(&self) -> Vec<LayerStackSite> {
		self.graph
			.nodes_in_strength_order()
			.into_iter()
			.map(|index| self.graph.node_site(index))
			.collect()
	}

	/// Compose the names of this prim's children across the index,
	/// applying relocations. Returns the composed name order and the set
	/// of names prohibited by relocations.
	pub fn compute_prim_child_names(&self) -> (Vec<tf::Token>, BTreeSet<tf::Token>) {
		let mut name_order = Vec::new();
		let mut name_set = BTreeSet::new();
		let mut prohibited = BTreeSet::new();

		if self.is_valid() {
			self.compose_child_names(0, &mut name_order, &mut name_set, &mut prohibited);
		}

		if !prohibited.is_empty() {
			name_order.retain(|name| !prohibited.contains(name));
		}

		(name_order, prohibited)
	}

	// Weak-to-strong traversal so that stronger sites compose over the
	// accumulated result.
	fn compose_child_names(
		&self,
		node_idx: u16,
		name_order: &mut Vec<tf::Token>,
		name_set: &mut BTreeSet<tf::Token>,
		prohibited: &mut BTreeSet<tf::Token>,
	) {
		let node = &self.graph.nodes[node_idx as usize];
		if node.culled {
			return;
		}

		for child in self.graph.children(node_idx).into_iter().rev() {
			self.compose_child_names(child, name_order, name_set, prohibited);
		}

		if !self.usd {
			self.apply_relocates_to_child_names(node_idx, name_order, name_set, prohibited);
		}

		if node.can_contribute_specs() {
			composer::compose_site_child_names(
				&node.layer_stack,
				&self.graph.unshared[node_idx as usize].site_path,
				name_order,
				name_set,
			);
		}
	}

	fn apply_relocates_to_child_names(
		&self,
		node_idx: u16,
		name_order: &mut Vec<tf::Token>,
		name_set: &mut BTreeSet<tf::Token>,
		prohibited: &mut BTreeSet<tf::Token>,
	) {
		let node = &self.graph.nodes[node_idx as usize];
		let path = &self.graph.unshared[node_idx as usize].site_path;

		let mut names_to_add = BTreeSet::new();
		let mut names_to_remove = BTreeSet::new();
		let mut names_to_replace = BTreeMap::new();

		// Relocations with a child as source rename or remove it here; the
		// source name becomes prohibited either way.
		for (source, target) in node.layer_stack.incremental_relocates_source_to_target() {
			if source.parent_path() == *path {
				if target.parent_path() == *path {
					names_to_replace.insert(source.name_token(), target.name_token());
				} else {
					names_to_remove.insert(source.name_token());
				}
				prohibited.insert(source.name_token());
			}
		}

		// Relocations with a child as target add it here.
		for (target, source) in node.layer_stack.incremental_relocates_target_to_source() {
			if target.parent_path() == *path
				&& source.parent_path() != *path
				&& !name_set.contains(&target.name_token())
			{
				names_to_add.insert(target.name_token());
			}
		}

		if !names_to_replace.is_empty() || !names_to_remove.is_empty() {
			let mut retained = Vec::with_capacity(name_order.len());
			for name in name_order.iter() {
				if let Some(new_name) = names_to_replace.get(name) {
					name_set.remove(name);
					// The new name may already be contributed by a weaker
					// site; the relocation silently shadows it.
					if name_set.insert(new_name.clone()) {
						retained.push(new_name.clone());
					}
				} else if names_to_remove.contains(name) {
					name_set.remove(name);
				} else {
					retained.push(name.clone());
				}
			}
			*name_order = retained;
		}

		for name in names_to_add {
			name_set.insert(name.clone());
			name_order.push(name);
		}
	}
}

/// Set of paths whose payloads should be composed, shared between the
/// consumer and concurrent index computations behind a reader-writer lock.
#[derive(Debug, Default)]
pub struct PayloadSet {
	inner: RwLock<HashSet<sdf::Path>>,
}

impl PayloadSet {
	pub fn insert(&self, path: sdf::Path) {
		self.inner.write().unwrap().insert(path);
	}

	pub fn remove(&self, path: &sdf::Path) {
		self.inner.write().unwrap().remove(path);
	}

	pub fn contains(&self, path: &sdf::Path) -> bool {
		self.inner.read().unwrap().contains(path)
	}
}

/// How the payload inclusion policy resolved for an index.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PayloadState {
	#[default]
	NoPayload,
	IncludedByPredicate,
	ExcludedByPredicate,
	IncludedByIncludeSet,
	ExcludedByIncludeSet,
}

/// Inputs to prim index computation. All fields are immutable for the
/// duration of a call.
#[derive(Clone)]
pub struct PrimIndexInputs {
	/// Ordered fallback selections per variant set name.
	pub variant_fallbacks: HashMap<String, Vec<String>>,
	/// Paths whose payloads are included. `None` means payloads are never
	/// included.
	pub included_payloads: Option<Arc<PayloadSet>>,
	/// Optional predicate overriding the include set.
	pub include_payload_predicate: Option<Arc<dyn Fn(&sdf::Path) -> bool + Send + Sync>>,
	/// Remove nodes that contribute no opinions.
	pub cull: bool,
	/// USD mode: disables permissions, symmetry, relocations and
	/// prim-stack retention.
	pub usd: bool,
	/// Target passed through to layer resolution.
	pub file_format_target: String,
	/// The layer-stack provider and layer opener.
	pub cache: Arc<PcpCache>,
	/// Optional precomputed parent index; bypasses the recursive parent
	/// step of the driver.
	pub parent_index: Option<Arc<PrimIndex>>,
}

impl PrimIndexInputs {
	pub fn new(cache: Arc<PcpCache>) -> Self {
		Self {
			variant_fallbacks: HashMap::new(),
			included_payloads: None,
			include_payload_predicate: None,
			cull: true,
			usd: false,
			file_format_target: String::new(),
			cache,
			parent_index: None,
		}
	}
}

impl std::fmt::Debug for PrimIndexInputs {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PrimIndexInputs")
			.field("variant_fallbacks", &self.variant_fallbacks)
			.field("cull", &self.cull)
			.field("usd", &self.usd)
			.field("file_format_target", &self.file_format_target)
			.finish_non_exhaustive()
	}
}

/// A node culled from an index that carried ancestral dependencies; kept
/// so consumers can track it even though the node was removed.
#[derive(Debug, Clone, PartialEq)]
pub struct CulledDependency {
	pub layer_stack: String,
	pub site_path: sdf::Path,
}

/// Outputs of prim index computation.
#[derive(Debug, Default)]
pub struct PrimIndexOutputs {
	pub prim_index: PrimIndex,
	pub all_errors: Vec<PcpError>,
	/// Field names consulted while composing dynamic file format
	/// arguments.
	pub dynamic_file_format_dependency: BTreeSet<String>,
	/// Expression variables consulted per layer stack identifier.
	pub expression_variables_dependency: BTreeMap<String, BTreeSet<String>>,
	pub culled_dependencies: Vec<CulledDependency>,
	pub payload_state: PayloadState,
	pub(crate) capacity_flags: CapacityFlags,
}

/// Build the prim index for `path` in `layer_stack`.
///
/// This is the top-level driver: it seeds the task queue from the root
/// node, drains it, then finalizes the graph (permission enforcement,
/// instanceability, culling compaction, prim-stack gathering).
pub fn compute_prim_index(
	layer_stack: Arc<LayerStack>,
	path: sdf::Path,
	inputs: &PrimIndexInputs,
) -> PrimIndexOutputs {
	debug_assert!(
		path.is_absolute_root_or_prim_path() || path.is_prim_variant_selection_path(),
		"path {path} must identify a prim, a prim variant selection, or the absolute root"
	);

	let mut outputs = PrimIndexOutputs::default();
	let site = LayerStackSite::new(layer_stack, path);

	indexer::build_prim_index(
		&site, &site, 0, true, true, true, None, inputs, &mut outputs,
	);

	outputs.prim_index.usd = inputs.usd;

	if !inputs.usd {
		indexer::enforce_permissions(&mut outputs);
	}

	outputs.prim_index.graph.instanceable = compute_instanceable(&outputs.prim_index);

	outputs.prim_index.graph.finalize();

	if !inputs.usd {
		gather_prim_stack(&mut outputs.prim_index);
	}

	outputs
}

// An index is instanceable when composed metadata asks for it and at least
// one direct arc supplies opinions that instancing can share.
pub(crate) fn compute_instanceable(index: &PrimIndex) -> bool {
	let has_direct_arc = index
		.graph
		.nodes
		.iter()
		.enumerate()
		.any(|(i, node)| i != 0 && !node.is_due_to_ancestor);
	if !has_direct_arc {
		return false;
	}

	for node_idx in index.graph.nodes_in_strength_order() {
		let node = &index.graph.nodes[node_idx as usize];
		if !node.can_contribute_specs() {
			continue;
		}
		let path = &index.graph.unshared[node_idx as usize].site_path;
		for layer in &node.layer_stack.layers {
			if let Some(value) = layer.field(path, &FIELD_KEYS.instanceable)
				&& let Some(instanceable) = value.get::<bool>()
			{
				return instanceable;
			}
		}
	}
	false
}

fn gather_prim_stack(index: &mut PrimIndex) {
	let mut prim_stack = Vec::new();
	for node_idx in index.graph.nodes_in_strength_order() {
		let node = &index.graph.nodes[node_idx as usize];
		if node.culled || !node.can_contribute_specs() {
			continue;
		}
		let path = &index.graph.unshared[node_idx as usize].site_path;
		for layer in &node.layer_stack.layers {
			if layer.has_spec(path) {
				prim_stack.push((node_idx, layer.clone()));
			}
		}
	}
	index.prim_stack = prim_stack;
}
