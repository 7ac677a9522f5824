use super::cache::DynamicFileFormatContext;
use super::composer::{self, ArcItem};
use super::error::{CycleSegment, ErrorSite, PcpError};
use super::graph::{INVALID_NODE_INDEX, Node, PrimIndexGraph};
use super::map_expression::{MapExpression, MapFunction};
use super::prim_index::{
	CulledDependency, PayloadState, PrimIndexInputs, PrimIndexOutputs, compute_instanceable,
};
use super::task::{Task, TaskQueue, TaskType};
use super::{ArcType, LayerStackSite};
use crate::sdf;
use std::collections::BTreeSet;
use std::sync::OnceLock;
use tracing::debug;

/// Linkage between nested prim-index constructions, letting the inner
/// algorithm see the partial outer graphs for cycle detection, duplicate
/// detection and variant resolution. Cross-frame path translation is the
/// prefix replacement `(current root path, requested path)`.
pub(crate) struct StackFrame<'a> {
	pub requested_site: LayerStackSite,
	/// The node in `graph` the sub-index is being built beneath.
	pub parent_node: u16,
	/// The arc the sub-index will be grafted with.
	pub arc_type: ArcType,
	pub arc_map_to_parent: MapExpression,
	pub skip_duplicate_nodes: bool,
	/// The enclosing partial graph.
	pub graph: &'a PrimIndexGraph,
	pub previous: Option<&'a StackFrame<'a>>,
}

// The legacy "standin" variant set defers to fallbacks in several extra
// situations; setting PCP_NEW_DEFAULT_STANDIN_BEHAVIOR=0 restores that
// behavior.
fn new_default_standin_behavior() -> bool {
	static FLAG: OnceLock<bool> = OnceLock::new();
	*FLAG.get_or_init(|| {
		std::env::var("PCP_NEW_DEFAULT_STANDIN_BEHAVIOR")
			.map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
			.unwrap_or(true)
	})
}

/// Where a composed variant selection came from; carried so the standin
/// fallback policy can inspect the provenance without holding node
/// references across graphs.
#[derive(Debug, Clone)]
struct VselSource {
	arc_type: ArcType,
	is_variant_for_vset: bool,
	beneath_payload: bool,
}

/// Build the prim index for `site`.
///
/// Establishes the initial graph (one node for the absolute root or a
/// variant selection; the rebased parent index otherwise), seeds the task
/// queue from the root node and drains it, dispatching each task to its
/// evaluator.
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_prim_index(
	site: &LayerStackSite,
	root_site: &LayerStackSite,
	ancestor_recursion_depth: u32,
	evaluate_implied_specializes: bool,
	evaluate_variants: bool,
	root_contributes_specs: bool,
	previous_frame: Option<&StackFrame<'_>>,
	inputs: &PrimIndexInputs,
	outputs: &mut PrimIndexOutputs,
) {
	debug!(site = %site, "building prim index");

	if site.path.is_absolute_root() {
		// Base case for the absolute root: just the single site. No
		// composition arcs can live on it.
		let mut graph = PrimIndexGraph::new();
		let mut node = Node::new(
			site.layer_stack.clone(),
			INVALID_NODE_INDEX,
			INVALID_NODE_INDEX,
			ArcType::Root,
			MapExpression::identity(),
		);
		node.has_specs = composer::compose_site_has_prim_specs(&site.layer_stack, &site.path);
		graph.add_node(node, site.path.clone());
		outputs.prim_index.graph = graph;
		return;
	}

	if site.path.is_prim_variant_selection_path() {
		// Variant selection paths do not recurse on the parent: variant
		// arcs are evaluated while indexing the parent path, which already
		// accounts for ancestral opinions about the variant.
		let mut graph = PrimIndexGraph::new();
		let mut node = Node::new(
			site.layer_stack.clone(),
			INVALID_NODE_INDEX,
			INVALID_NODE_INDEX,
			ArcType::Root,
			MapExpression::identity(),
		);
		node.has_specs = composer::compose_site_has_prim_specs(&site.layer_stack, &site.path);
		node.inert = !root_contributes_specs;
		graph.add_node(node, site.path.clone());
		outputs.prim_index.graph = graph;
	} else {
		build_initial_prim_index_from_ancestor(
			site,
			root_site,
			ancestor_recursion_depth,
			evaluate_implied_specializes,
			root_contributes_specs,
			previous_frame,
			inputs,
			outputs,
		);
	}

	let mut indexer = PrimIndexer {
		root_site: root_site.clone(),
		ancestor_recursion_depth,
		inputs,
		outputs,
		previous_frame,
		tasks: TaskQueue::default(),
		evaluate_implied_specializes,
		evaluate_variants,
	};
	indexer.add_tasks_for_root_node(0);
	indexer.run();
}

// Account for ancestral opinions by building the namespace parent's index,
// rebasing every site one level deeper, and resetting the per-prim state.
#[allow(clippy::too_many_arguments)]
fn build_initial_prim_index_from_ancestor(
	site: &LayerStackSite,
	root_site: &LayerStackSite,
	ancestor_recursion_depth: u32,
	evaluate_implied_specializes: bool,
	root_contributes_specs: bool,
	previous_frame: Option<&StackFrame<'_>>,
	inputs: &PrimIndexInputs,
	outputs: &mut PrimIndexOutputs,
) {
	let parent_site = LayerStackSite::new(site.layer_stack.clone(), site.path.parent_path());

	let precomputed_parent = previous_frame.is_none()
		&& evaluate_implied_specializes
		&& inputs.parent_index.as_ref().is_some_and(|parent| {
			parent.is_valid()
				&& parent.path() == parent_site.path
				&& std::sync::Arc::ptr_eq(
					&parent.graph.nodes[0].layer_stack,
					&parent_site.layer_stack,
				)
		});

	let ancestor_instanceable = if precomputed_parent {
		let parent = inputs.parent_index.as_ref().unwrap();
		outputs.prim_index.graph = parent.graph.clone();
		parent.is_instanceable()
	} else {
		// Variants are always evaluated here so that ancestral opinions
		// include variant resolutions.
		build_prim_index(
			&parent_site,
			&parent_site,
			ancestor_recursion_depth + 1,
			evaluate_implied_specializes,
			true,
			true,
			previous_frame,
			inputs,
			outputs,
		);
		compute_instanceable(&outputs.prim_index)
	};

	// In an instanceable ancestor, opinions beneath ancestral arcs cannot
	// vary per instance; disable them.
	if ancestor_instanceable {
		disable_non_instanceable_nodes(&mut outputs.prim_index.graph);
	}

	let graph = &mut outputs.prim_index.graph;
	graph.append_child_name_to_all_sites(&site.path);

	// The payload bit tracks payloads introduced by this prim, not its
	// ancestors.
	graph.has_payloads = false;
	outputs.payload_state = PayloadState::NoPayload;

	convert_graph_for_child(graph, inputs);

	if inputs.cull {
		cull_subtrees_with_no_opinions(graph, 0, root_site);
	}

	if !root_contributes_specs {
		graph.nodes[0].inert = true;
	}
}

// The child site is one namespace level deeper than the parent's, so spec
// presence and site-derived flags must be recomputed. Every surviving node
// of the parent index is, from the child's point of view, ancestral.
fn convert_graph_for_child(graph: &mut PrimIndexGraph, inputs: &PrimIndexInputs) {
	for index in 0..graph.nodes.len() {
		let (layer_stack, site_path) = {
			let node = &graph.nodes[index];
			(node.layer_stack.clone(), graph.unshared[index].site_path.clone())
		};

		let node = &mut graph.nodes[index];
		if node.has_specs {
			node.has_specs = composer::compose_site_has_prim_specs(&layer_stack, &site_path);
		}

		if !inputs.usd && !node.inert && node.has_specs {
			// A private parent permission is inherited; otherwise
			// recompute at the child site. Same for symmetry.
			if node.permission == sdf::Permission::Public {
				node.permission = composer::compose_site_permission(&layer_stack, &site_path);
			}
			if !node.has_symmetry {
				node.has_symmetry = composer::compose_site_has_symmetry(&layer_stack, &site_path);
			}
		}

		if index != 0 {
			node.is_due_to_ancestor = true;
		}
	}
}

fn disable_non_instanceable_nodes(graph: &mut PrimIndexGraph) {
	// Walk strong-to-weak; a node can vary per instance only if every arc
	// from the root down to it was introduced directly at this prim.
	let mut stack: Vec<(u16, bool)> = vec![(0, true)];
	while let Some((index, instanceable)) = stack.pop() {
		if !instanceable {
			graph.nodes[index as usize].inert = true;
		}
		for child in graph.children(index) {
			let child_instanceable =
				instanceable && !graph.nodes[child as usize].is_due_to_ancestor;
			stack.push((child, child_instanceable));
		}
	}
}

fn cull_subtrees_with_no_opinions(
	graph: &mut PrimIndexGraph,
	node: u16,
	root_site: &LayerStackSite,
) {
	for child in graph.children(node) {
		// Specializes subtrees are kept in duplicate at the root and their
		// origin; culling beneath them would have to be kept consistent in
		// both places, so skip them.
		if graph.nodes[child as usize].arc_type.is_specialize() {
			continue;
		}
		cull_subtrees_with_no_opinions(graph, child, root_site);
	}

	if node_can_be_culled(graph, node, root_site) {
		graph.nodes[node as usize].culled = true;
	}
}

// A node can be culled when neither it nor any descendant contributes
// opinions. The exceptions keep nodes that introduce arcs, carry symmetry
// or restrictions, or represent subroot inherits in the root layer stack.
fn node_can_be_culled(graph: &PrimIndexGraph, index: u16, root_site: &LayerStackSite) -> bool {
	let node = &graph.nodes[index as usize];

	if node.culled {
		return true;
	}

	// The root node of a prim index is never culled; if needed it is
	// culled when grafted into another index.
	if node.parent_index == INVALID_NODE_INDEX {
		return false;
	}

	// Nodes that denote the addition of a new arc introduce dependencies
	// and must remain discoverable.
	if graph.depth_below_introduction(index) == 0 {
		return false;
	}

	if node.has_symmetry || node.restricted {
		return false;
	}

	// Subroot inherits in the root layer stack exist in the composed scene
	// even without specs; consumers enumerate them.
	if node.arc_type == ArcType::Inherit
		&& std::sync::Arc::ptr_eq(&node.layer_stack, &root_site.layer_stack)
	{
		let origin = if node.origin_index == node.parent_index {
			index
		} else {
			graph.origin_root(index)
		};
		if !graph.path_at_introduction(origin).is_root_prim_path() {
			return false;
		}
	}

	for child in graph.children(index) {
		if !graph.nodes[child as usize].culled {
			return false;
		}
	}

	!(node.has_specs && node.can_contribute_specs())
}

/// Walk all nodes weak to strong; once a private node is seen, every
/// stronger node that could contribute specs is restricted, and an error
/// is reported for each that actually has one.
pub(crate) fn enforce_permissions(outputs: &mut PrimIndexOutputs) {
	let order = outputs.prim_index.graph.nodes_in_strength_order();
	let root_site = ErrorSite::new(&outputs.prim_index.graph.node_site(0));

	let mut private_node: Option<u16> = None;
	let mut errors = Vec::new();
	{
		let graph = &mut outputs.prim_index.graph;
		for &index in order.iter().rev() {
			if !graph.nodes[index as usize].can_contribute_specs() {
				continue;
			}

			if let Some(private_index) = private_node {
				graph.nodes[index as usize].restricted = true;

				if graph.nodes[index as usize].has_specs {
					let site = graph.node_site(index);
					let has_spec = graph.nodes[index as usize]
						.layer_stack
						.layers
						.iter()
						.any(|layer| layer.has_spec(&site.path));
					if has_spec {
						errors.push(PcpError::PrimPermissionDenied {
							root_site: root_site.clone(),
							site: ErrorSite::new(&site),
							private_site: ErrorSite::new(&graph.node_site(private_index)),
						});
					}
				}
			}

			if private_node.is_none()
				&& graph.nodes[index as usize].permission != sdf::Permission::Public
			{
				private_node = Some(index);
			}
		}
	}

	for error in errors {
		outputs.prim_index.local_errors.push(error.clone());
		outputs.all_errors.push(error);
	}
}

// Bitfield of composition arc types authored at a site, used as a
// preflight scan so only evaluators with work to do get queued.
const ARC_FLAG_INHERITS: u32 = 1 << 0;
const ARC_FLAG_VARIANTS: u32 = 1 << 1;
const ARC_FLAG_REFERENCES: u32 = 1 << 2;
const ARC_FLAG_PAYLOADS: u32 = 1 << 3;
const ARC_FLAG_SPECIALIZES: u32 = 1 << 4;

/// Tracks which tasks remain to finish building the graph. As new nodes
/// are added, task entries are queued so that they are processed in the
/// priority order of the algorithm.
struct PrimIndexer<'i, 'f> {
	root_site: LayerStackSite,
	ancestor_recursion_depth: u32,
	inputs: &'i PrimIndexInputs,
	outputs: &'i mut PrimIndexOutputs,
	previous_frame: Option<&'f StackFrame<'f>>,
	tasks: TaskQueue,
	evaluate_implied_specializes: bool,
	evaluate_variants: bool,
}

impl PrimIndexer<'_, '_> {
	fn graph(&self) -> &PrimIndexGraph {
		&self.outputs.prim_index.graph
	}

	fn graph_mut(&mut self) -> &mut PrimIndexGraph {
		&mut self.outputs.prim_index.graph
	}

	fn run(&mut self) {
		while let Some(task) = self.tasks.pop(&self.outputs.prim_index.graph) {
			match task.task_type {
				TaskType::EvalNodeRelocations => self.eval_node_relocations(task.node),
				TaskType::EvalImpliedRelocations => self.eval_implied_relocations(task.node),
				TaskType::EvalNodeReferences => self.eval_node_references(task.node),
				TaskType::EvalNodePayload => self.eval_node_payloads(task.node),
				TaskType::EvalNodeInherits => self.eval_node_inherits(task.node),
				TaskType::EvalImpliedClasses => self.eval_implied_classes(task.node),
				TaskType::EvalNodeSpecializes => self.eval_node_specializes(task.node),
				TaskType::EvalImpliedSpecializes => self.eval_implied_specializes(task.node),
				TaskType::EvalNodeVariantSets => self.eval_node_variant_sets(task.node),
				TaskType::EvalNodeVariantAuthored => {
					self.eval_node_variant_authored(task.node, &task.vset_name, task.vset_num)
				}
				TaskType::EvalNodeVariantFallback => {
					self.eval_node_variant_fallback(task.node, &task.vset_name, task.vset_num)
				}
				// Markers for retry_variant_tasks; nothing to do.
				TaskType::EvalNodeVariantNoneFound => {}
			}
		}
	}

	fn record_error(&mut self, error: PcpError) {
		debug!(error = %error, "composition error");
		self.outputs.prim_index.local_errors.push(error.clone());
		self.outputs.all_errors.push(error);
	}

	fn record_expression_vars(&mut self, layer_stack: String, vars: BTreeSet<String>) {
		if vars.is_empty() {
			return;
		}
		self.outputs
			.expression_variables_dependency
			.entry(layer_stack)
			.or_default()
			.extend(vars);
	}

	fn root_error_site(&self) -> ErrorSite {
		ErrorSite::new(&self.graph().node_site(0))
	}

	fn node_error_site(&self, node: u16) -> ErrorSite {
		ErrorSite::new(&self.graph().node_site(node))
	}

	fn can_contribute(&self, node: u16) -> bool {
		self.graph().nodes[node as usize].can_contribute_specs()
	}

	fn inert_subtree(&mut self, node: u16) {
		self.graph_mut().nodes[node as usize].inert = true;
		for child in self.graph().children(node) {
			self.inert_subtree(child);
		}
	}

	fn elide_subtree(&mut self, node: u16) {
		if self.inputs.cull {
			self.graph_mut().nodes[node as usize].culled = true;
		} else {
			self.graph_mut().nodes[node as usize].inert = true;
		}
		for child in self.graph().children(node) {
			self.elide_subtree(child);
		}
	}

	fn prim_spec_exists_under(&self, node: u16) -> bool {
		if self.graph().nodes[node as usize].has_specs {
			return true;
		}
		self.graph()
			.children(node)
			.into_iter()
			.any(|child| self.prim_spec_exists_under(child))
	}
}

/// Task enqueueing.
impl PrimIndexer<'_, '_> {
	fn scan_arcs(&self, node: u16) -> u32 {
		let graph = self.graph();
		let layer_stack = &graph.nodes[node as usize].layer_stack;
		let path = &graph.unshared[node as usize].site_path;

		let mut arcs = 0;
		for layer in &layer_stack.layers {
			if !layer.has_spec(path) {
				continue;
			}
			if layer.has_field(path, &sdf::FIELD_KEYS.inherit_paths) {
				arcs |= ARC_FLAG_INHERITS;
			}
			if layer.has_field(path, &sdf::FIELD_KEYS.variant_set_names) {
				arcs |= ARC_FLAG_VARIANTS;
			}
			if layer.has_field(path, &sdf::FIELD_KEYS.references) {
				arcs |= ARC_FLAG_REFERENCES;
			}
			if layer.has_field(path, &sdf::FIELD_KEYS.payload) {
				arcs |= ARC_FLAG_PAYLOADS;
			}
			if layer.has_field(path, &sdf::FIELD_KEYS.specializes) {
				arcs |= ARC_FLAG_SPECIALIZES;
			}
		}
		arcs
	}

	fn add_tasks_for_root_node(&mut self, root: u16) {
		self.add_tasks_for_node_recursively(root, false, false);
	}

	fn add_tasks_for_node(
		&mut self,
		node: u16,
		skip_expressed_arc_tasks: bool,
		skip_implied_specializes_completed: bool,
	) {
		if !skip_implied_specializes_completed {
			let arc_type = self.graph().nodes[node as usize].arc_type;
			if arc_type.is_class_based() {
				// The new node is itself class-based. Find the starting
				// node of the chain of classes it belongs to and propagate
				// the entire chain as one unit.
				if let Some(base) = self.find_starting_node_for_implied_classes(node) {
					self.tasks.add(Task::new(TaskType::EvalImpliedClasses, base));
				}
			} else if self.has_class_based_child(node) {
				// Class-based children found during recursive computation
				// of the subgraph must be picked up now that the subgraph
				// is merged into the parent graph.
				self.tasks.add(Task::new(TaskType::EvalImpliedClasses, node));
			}

			if self.evaluate_implied_specializes {
				if let Some(base) = self.find_starting_node_for_implied_specializes(node) {
					self.tasks
						.add(Task::new(TaskType::EvalImpliedSpecializes, base));
				} else if self.has_specializes_child(node) {
					self.tasks
						.add(Task::new(TaskType::EvalImpliedSpecializes, node));
				}
			}
		}

		self.add_tasks_for_node_recursively(
			node,
			skip_expressed_arc_tasks,
			skip_implied_specializes_completed,
		);
	}

	fn add_tasks_for_node_recursively(
		&mut self,
		node: u16,
		skip_expressed_arc_tasks: bool,
		skip_implied_specializes_completed: bool,
	) {
		for child in self.graph().children(node) {
			self.add_tasks_for_node_recursively(
				child,
				skip_expressed_arc_tasks,
				skip_implied_specializes_completed,
			);
		}

		let node_ref = &self.graph().nodes[node as usize];
		let contributes = node_ref.has_specs && node_ref.can_contribute_specs();
		let arc_type = node_ref.arc_type;
		let arc_mask = if contributes { self.scan_arcs(node) } else { 0 };

		if skip_implied_specializes_completed {
			// Nodes propagated back from the root were already composed;
			// only the tasks that come after implied specializes apply.
			if self.evaluate_variants && arc_mask & ARC_FLAG_VARIANTS != 0 {
				self.tasks.add(Task::new(TaskType::EvalNodeVariantSets, node));
			}
			return;
		}

		if self.evaluate_variants && arc_mask & ARC_FLAG_VARIANTS != 0 {
			self.tasks.add(Task::new(TaskType::EvalNodeVariantSets, node));
		}
		if !skip_expressed_arc_tasks {
			// Subtrees recursively indexed for ancestral opinions (and
			// specializes subtrees propagated back to their origin) have
			// already processed their expressed arcs.
			if arc_mask & ARC_FLAG_SPECIALIZES != 0 {
				self.tasks.add(Task::new(TaskType::EvalNodeSpecializes, node));
			}
			if arc_mask & ARC_FLAG_INHERITS != 0 {
				self.tasks.add(Task::new(TaskType::EvalNodeInherits, node));
			}
			if arc_mask & ARC_FLAG_PAYLOADS != 0 {
				self.tasks.add(Task::new(TaskType::EvalNodePayload, node));
			}
			if arc_mask & ARC_FLAG_REFERENCES != 0 {
				self.tasks.add(Task::new(TaskType::EvalNodeReferences, node));
			}
			if !self.inputs.usd {
				self.tasks.add(Task::new(TaskType::EvalNodeRelocations, node));
			}
		}
		if !self.inputs.usd && arc_type == ArcType::Relocate {
			self.tasks
				.add(Task::new(TaskType::EvalImpliedRelocations, node));
		}
	}

	fn has_class_based_child(&self, node: u16) -> bool {
		self.graph()
			.children(node)
			.into_iter()
			.any(|child| self.graph().nodes[child as usize].arc_type.is_class_based())
	}

	fn has_specializes_child(&self, node: u16) -> bool {
		self.graph()
			.children(node)
			.into_iter()
			.any(|child| self.graph().nodes[child as usize].arc_type.is_specialize())
	}
}

/// Arc insertion.
impl PrimIndexer<'_, '_> {
	fn add_arc(
		&mut self,
		arc_type: ArcType,
		parent: u16,
		origin: u16,
		site: &LayerStackSite,
		map_expr: MapExpression,
		sibling_num: usize,
		direct_contributes: bool,
		include_ancestral: bool,
		skip_duplicate: bool,
	) -> Option<u16> {
		// Variant selections are path components but not namespace levels;
		// they must not count toward the introduction depth.
		let namespace_depth = self.graph().unshared[parent as usize]
			.site_path
			.non_variant_element_count();

		self.add_arc_full(
			arc_type,
			parent,
			origin,
			site,
			map_expr,
			sibling_num,
			namespace_depth,
			direct_contributes,
			include_ancestral,
			skip_duplicate,
			false,
			false,
		)
	}

	#[allow(clippy::too_many_arguments)]
	fn add_arc_full(
		&mut self,
		arc_type: ArcType,
		parent: u16,
		origin: u16,
		site: &LayerStackSite,
		map_expr: MapExpression,
		sibling_num: usize,
		namespace_depth: usize,
		mut direct_contributes: bool,
		include_ancestral: bool,
		mut skip_duplicate: bool,
		skip_implied_specializes_completed: bool,
		skip_expressed_arc_tasks: bool,
	) -> Option<u16> {
		debug!(
			arc = %arc_type,
			site = %site,
			parent = %self.graph().node_site(parent),
			"adding arc"
		);

		if let Some(error) = self.check_for_cycle(parent, origin, arc_type, site) {
			self.record_error(error);
			return None;
		}

		if let Some(frame) = self.previous_frame {
			skip_duplicate |= frame.skip_duplicate_nodes;
		}
		if skip_duplicate && self.find_duplicate_node(parent, site) {
			return None;
		}

		if sibling_num >= INVALID_NODE_INDEX as usize {
			if !self.outputs.capacity_flags.arc_reported {
				self.outputs.capacity_flags.arc_reported = true;
				let error = PcpError::ArcCapacityExceeded {
					root_site: ErrorSite::new(&self.root_site),
				};
				self.record_error(error);
			}
			return None;
		}
		if namespace_depth >= INVALID_NODE_INDEX as usize {
			if !self.outputs.capacity_flags.depth_reported {
				self.outputs.capacity_flags.depth_reported = true;
				let error = PcpError::ArcNamespaceDepthCapacityExceeded {
					root_site: ErrorSite::new(&self.root_site),
				};
				self.record_error(error);
			}
			return None;
		}

		// Salted earth: a relocation source may not carry direct opinions.
		// Only non-root prims can be relocated, so the ancestral flag
		// limits the check.
		if direct_contributes
			&& include_ancestral
			&& site.layer_stack.has_relocates_source_at_or_under(&site.path)
		{
			direct_contributes = false;
		}

		let new_node = if !include_ancestral {
			// No ancestral opinions. Just add the single new site.
			if self.graph().is_full() {
				self.report_index_capacity();
				return None;
			}

			let mut node = Node::new(
				site.layer_stack.clone(),
				parent,
				origin,
				arc_type,
				map_expr,
			);
			node.namespace_depth = namespace_depth as u16;
			node.sibling_num_at_origin = sibling_num as u16;
			node.inert = !direct_contributes;
			node.has_specs =
				composer::compose_site_has_prim_specs(&site.layer_stack, &site.path);
			if !node.inert && node.has_specs && !self.inputs.usd {
				node.permission = composer::compose_site_permission(&site.layer_stack, &site.path);
				node.has_symmetry =
					composer::compose_site_has_symmetry(&site.layer_stack, &site.path);
			}

			self.graph_mut().add_child(parent, node, site.path.clone())
		} else {
			// Ancestral opinions are those above the source site in
			// namespace. Build out the full index for the site and graft
			// its root as the new child.
			//
			// Implied specializes are deferred until the source index is
			// merged, so its specializes arcs propagate to the final
			// graph's root. Variants are deferred too: the source site
			// alone cannot see stronger selections authored outside it.
			let mut child_outputs = PrimIndexOutputs::default();
			{
				let parent_graph = std::mem::take(&mut self.outputs.prim_index.graph);
				let frame = StackFrame {
					requested_site: site.clone(),
					parent_node: parent,
					arc_type,
					arc_map_to_parent: map_expr.clone(),
					skip_duplicate_nodes: skip_duplicate,
					graph: &parent_graph,
					previous: self.previous_frame,
				};
				build_prim_index(
					site,
					&self.root_site,
					self.ancestor_recursion_depth,
					false,
					false,
					direct_contributes,
					Some(&frame),
					self.inputs,
					&mut child_outputs,
				);
				self.outputs.prim_index.graph = parent_graph;
			}

			let child_graph_len = child_outputs.prim_index.graph.nodes.len();
			if self.graph().nodes.len() + child_graph_len >= INVALID_NODE_INDEX as usize {
				self.report_index_capacity();
				return None;
			}

			self.merge_child_outputs(&mut child_outputs);

			let new_node = self.graph_mut().insert_child_subgraph(
				parent,
				child_outputs.prim_index.graph,
				origin,
				arc_type,
				map_expr,
				namespace_depth as u16,
				sibling_num as u16,
			);

			// Culled nodes in the subtree carried ancestral dependencies;
			// they will be removed at finalize, so record them now. Only
			// the top-level call does this to avoid rescanning subtrees
			// across recursion levels.
			if self.previous_frame.is_none() {
				self.collect_culled_dependencies(new_node);
			}

			new_node
		};

		if self.inputs.cull {
			if node_can_be_culled(self.graph(), new_node, &self.root_site) {
				self.graph_mut().nodes[new_node as usize].culled = true;
			} else {
				// Culled ancestors now have an unculled subtree beneath
				// them; restore them to keep the culling invariant.
				let mut current = parent;
				while current != INVALID_NODE_INDEX
					&& self.graph().nodes[current as usize].culled
				{
					self.graph_mut().nodes[current as usize].culled = false;
					current = self.graph().nodes[current as usize].parent_index;
				}
			}
		}

		// A nested index build has already evaluated the expressed arcs on
		// this subgraph.
		let skip_expressed = skip_expressed_arc_tasks || include_ancestral;
		self.add_tasks_for_node(new_node, skip_expressed, skip_implied_specializes_completed);

		// An arc may not directly target a private site. Keep the subtree
		// for dependency tracking, but suppress its opinions.
		if self.graph().nodes[new_node as usize].permission == sdf::Permission::Private {
			let error = PcpError::ArcPermissionDenied {
				root_site: self.root_error_site(),
				site: self.node_error_site(parent),
				private_site: self.node_error_site(new_node),
				arc_type,
			};
			self.record_error(error);
			self.inert_subtree(new_node);
		}

		// A node at the absolute root is a dependency placeholder for an
		// unresolved default-target reference or payload.
		if self.graph().unshared[new_node as usize].site_path.is_absolute_root() {
			self.inert_subtree(new_node);
		}

		Some(new_node)
	}

	fn report_index_capacity(&mut self) {
		if !self.outputs.capacity_flags.index_reported {
			self.outputs.capacity_flags.index_reported = true;
			let error = PcpError::IndexCapacityExceeded {
				root_site: ErrorSite::new(&self.root_site),
			};
			self.record_error(error);
		}
	}

	fn merge_child_outputs(&mut self, child: &mut PrimIndexOutputs) {
		self.outputs.all_errors.append(&mut child.all_errors);
		self.outputs
			.dynamic_file_format_dependency
			.append(&mut child.dynamic_file_format_dependency);
		for (layer_stack, vars) in std::mem::take(&mut child.expression_variables_dependency) {
			self.outputs
				.expression_variables_dependency
				.entry(layer_stack)
				.or_default()
				.extend(vars);
		}
		self.outputs
			.culled_dependencies
			.append(&mut child.culled_dependencies);

		// The parent's payload state wins over the child's.
		if self.outputs.payload_state == PayloadState::NoPayload {
			self.outputs.payload_state = child.payload_state;
		}
	}

	fn collect_culled_dependencies(&mut self, node: u16) {
		if self.graph().nodes[node as usize].culled {
			let site = self.graph().node_site(node);
			self.outputs.culled_dependencies.push(CulledDependency {
				layer_stack: site.layer_stack.identifier().to_string(),
				site_path: site.path,
			});
		}
		for child in self.graph().children(node) {
			self.collect_culled_dependencies(child);
		}
	}

	// A cycle exists when an ancestor (following parents, crossing stack
	// frames) shares the child's layer stack and one site path prefixes
	// the other. Variant arcs never cycle; implied class placeholders
	// beneath relocate nodes are exempt.
	fn check_for_cycle(
		&self,
		parent: u16,
		origin: u16,
		arc_type: ArcType,
		site: &LayerStackSite,
	) -> Option<PcpError> {
		if arc_type.is_class_based() && parent != origin {
			let mut cursor = FrameCursor::new(self.graph(), parent, self.previous_frame);
			while let Some(cursor_arc) = cursor.arc_type()
				&& cursor_arc.is_class_based()
			{
				if !cursor.next() {
					break;
				}
			}
			if cursor.arc_type() == Some(ArcType::Relocate) {
				return None;
			}
		}

		if arc_type == ArcType::Variant {
			// Variant selection components are storage addressing, not
			// namespace; /A{v=sel} beneath /A is not a cycle.
			return None;
		}

		let mut found_cycle = false;
		let mut child_path = site.path.clone();
		let mut level_graph = self.graph();
		let mut level_node = parent;
		let mut frame = self.previous_frame;
		loop {
			let mut current = level_node;
			while current != INVALID_NODE_INDEX {
				let node = &level_graph.nodes[current as usize];
				let node_path = &level_graph.unshared[current as usize].site_path;
				if std::sync::Arc::ptr_eq(&node.layer_stack, &site.layer_stack)
					&& (node_path.has_prefix(&child_path) || child_path.has_prefix(node_path))
				{
					found_cycle = true;
					break;
				}
				current = node.parent_index;
			}
			if found_cycle {
				break;
			}

			let Some(f) = frame else { break };

			// Convert the child site's path into the path it will have
			// once its subgraph lands in the outer graph.
			let current_root_path = &level_graph.unshared[0].site_path;
			child_path = if *current_root_path == child_path {
				f.requested_site.path.clone()
			} else {
				f.requested_site
					.path
					.replace_prefix(current_root_path, &child_path)
			};

			level_graph = f.graph;
			level_node = f.parent_node;
			frame = f.previous;
		}

		if !found_cycle {
			return None;
		}

		// Build the chain of participating arcs from root to leaf.
		let mut cycle = Vec::new();
		let mut cursor = FrameCursor::new(self.graph(), parent, self.previous_frame);
		loop {
			cycle.push(CycleSegment {
				site: ErrorSite::new(&cursor.site()),
				arc_type: cursor.arc_type().unwrap_or(ArcType::Root),
			});
			if !cursor.next() {
				break;
			}
		}
		cycle.reverse();
		let root_site = cycle
			.first()
			.map(|seg| seg.site.clone())
			.unwrap_or_else(|| ErrorSite::new(&self.root_site));
		cycle.push(CycleSegment {
			site: ErrorSite::new(site),
			arc_type,
		});

		Some(PcpError::ArcCycle {
			root_site,
			site: ErrorSite::new(site),
			cycle,
		})
	}

	// Search the current graph and every enclosing frame's graph for a
	// node that already sits at this site, translating the path across
	// frame boundaries.
	fn find_duplicate_node(&self, _parent: u16, site: &LayerStackSite) -> bool {
		let mut translated = site.path.clone();
		let mut level_graph = self.graph();
		let mut frame = self.previous_frame;
		loop {
			let candidate = LayerStackSite::new(site.layer_stack.clone(), translated.clone());
			if level_graph.node_using_site(&candidate).is_some() {
				return true;
			}

			let Some(f) = frame else { return false };

			let current_root_path = &level_graph.unshared[0].site_path;
			translated = f
				.requested_site
				.path
				.replace_prefix(current_root_path, &translated);

			level_graph = f.graph;
			frame = f.previous;
		}
	}

	// Map expression for an arc targeting `node`: the single-pair map from
	// the source path to the node's (variant-stripped) path, composed with
	// the relocations affecting the target namespace.
	fn create_map_expression_for_arc(
		&self,
		source_path: &sdf::Path,
		node: u16,
		offset: sdf::Retiming,
	) -> MapExpression {
		let target_path = self.graph().unshared[node as usize]
			.site_path
			.strip_all_variant_selections();

		let function = MapFunction::new(vec![(source_path.clone(), target_path.clone())], offset);
		let expression = MapExpression::constant(function);

		if self.inputs.usd {
			expression
		} else {
			self.graph().nodes[node as usize]
				.layer_stack
				.relocates_expression_for_path(&target_path)
				.compose(&expression)
		}
	}
}

// A position while walking parent arcs across stack frames.
struct FrameCursor<'a> {
	graph: &'a PrimIndexGraph,
	node: u16,
	frame: Option<&'a StackFrame<'a>>,
}

impl<'a> FrameCursor<'a> {
	fn new(graph: &'a PrimIndexGraph, node: u16, frame: Option<&'a StackFrame<'a>>) -> Self {
		Self { graph, node, frame }
	}

	fn site(&self) -> LayerStackSite {
		self.graph.node_site(self.node)
	}

	// The arc type at this position: the node's own arc, or the arc being
	// built when sitting on a subgraph root with an enclosing frame.
	fn arc_type(&self) -> Option<ArcType> {
		let node = &self.graph.nodes[self.node as usize];
		if node.parent_index != INVALID_NODE_INDEX {
			Some(node.arc_type)
		} else {
			self.frame.map(|f| f.arc_type)
		}
	}

	fn next(&mut self) -> bool {
		let parent = self.graph.nodes[self.node as usize].parent_index;
		if parent != INVALID_NODE_INDEX {
			self.node = parent;
			return true;
		}
		if let Some(f) = self.frame {
			self.graph = f.graph;
			self.node = f.parent_node;
			self.frame = f.previous;
			return true;
		}
		false
	}
}

/// Relocations.
impl PrimIndexer<'_, '_> {
	// Handle the effects of relocations as namespace is walked down: if
	// this node's path is a relocation target, add a Relocate arc back to
	// the source, and elide the ancestral subtrees the relocation
	// supersedes.
	fn eval_node_relocations(&mut self, node: u16) {
		// A descendant without specs may still be affected by relocates,
		// so only skip nodes introduced at this namespace level.
		if !self.can_contribute(node) && self.graph().depth_below_introduction(node) == 0 {
			return;
		}

		// The incremental table keeps every authored step visible when
		// relocations nest across namespace levels; the combined form
		// would collapse them and hide intermediate sites.
		let node_path = self.graph().unshared[node as usize].site_path.clone();
		let layer_stack = self.graph().nodes[node as usize].layer_stack.clone();
		let Some(reloc_source) = layer_stack
			.incremental_relocates_target_to_source()
			.get(&node_path)
			.cloned()
		else {
			return;
		};

		debug!(target = %node_path, source = %reloc_source, "relocated node");

		// Ancestral opinions at a relocation target across a reference,
		// payload, inherit, specialize or older relocation are superseded
		// by the relocation source. Variants may still override.
		for child in self.graph().children(node) {
			match self.graph().nodes[child as usize].arc_type {
				ArcType::Variant | ArcType::Root => continue,
				ArcType::Relocate
				| ArcType::Reference
				| ArcType::Payload
				| ArcType::Inherit
				| ArcType::Specialize => {
					self.elide_subtree(child);
				}
			}
		}

		// The mapping for a relocation source node is identity: relocation
		// mappings are applied across the arcs whose targets they affect,
		// and the source node itself is a placeholder for ancestral arcs.
		let source_site = LayerStackSite::new(layer_stack, reloc_source);
		let new_node = self.add_arc(
			ArcType::Relocate,
			node,
			node,
			&source_site,
			MapExpression::identity(),
			0,
			// The direct site of a relocation source may not contribute
			// opinions; its children usually do, via ancestral arcs.
			false,
			true,
			false,
		);

		if let Some(new_node) = new_node {
			// Authored opinions at the relocation source are ignored;
			// report them.
			let new_site = self.graph().node_site(new_node);
			let sites = composer::compose_site_prim_sites(&new_site.layer_stack, &new_site.path);
			for (layer, path) in sites {
				let error = PcpError::OpinionAtRelocationSource {
					root_site: self.root_error_site(),
					layer: layer.identifier().to_string(),
					path,
				};
				self.record_error(error);
			}

			// Opinions in the new subtree that other relocations move to a
			// different prim must be elided, or the same site would
			// contribute to two prims.
			self.elide_relocated_subtrees(new_node);
		}
	}

	fn elide_relocated_subtrees(&mut self, node: u16) {
		for child in self.graph().children(node) {
			// Relocate children were handled when they were added.
			if self.graph().nodes[child as usize].arc_type == ArcType::Relocate {
				continue;
			}

			if self.can_contribute(child) {
				let child_path = &self.graph().unshared[child as usize].site_path;
				let relocated = self.graph().nodes[child as usize]
					.layer_stack
					.incremental_relocates_source_to_target()
					.contains_key(child_path);
				if relocated {
					self.elide_subtree(child);
					continue;
				}
			}

			self.elide_relocated_subtrees(child);
		}
	}

	// Propagate a relocation arc into the grand-parent's namespace so that
	// referring sites see the equivalent relocation.
	fn eval_implied_relocations(&mut self, node: u16) {
		let node_ref = &self.graph().nodes[node as usize];
		if node_ref.arc_type != ArcType::Relocate || node_ref.is_due_to_ancestor {
			return;
		}

		let parent = node_ref.parent_index;
		if parent == INVALID_NODE_INDEX {
			return;
		}
		let grand_parent = self.graph().nodes[parent as usize].parent_index;
		if grand_parent == INVALID_NODE_INDEX {
			return;
		}

		// The mapping may fail, e.g. when a sub-root reference targets the
		// relocation target: the source has no corresponding prim there.
		let node_path = self.graph().unshared[node as usize].site_path.clone();
		let gp_reloc_source = self.graph().nodes[parent as usize]
			.map_to_parent
			.map_source_to_target(&node_path);
		if gp_reloc_source.is_empty() {
			return;
		}

		for gp_child in self.graph().children(grand_parent) {
			if self.graph().unshared[gp_child as usize].site_path == gp_reloc_source
				&& self.graph().nodes[gp_child as usize].arc_type == ArcType::Relocate
			{
				return;
			}
		}

		let gp_layer_stack = self.graph().nodes[grand_parent as usize].layer_stack.clone();
		self.add_arc(
			ArcType::Relocate,
			grand_parent,
			node,
			&LayerStackSite::new(gp_layer_stack, gp_reloc_source),
			MapExpression::identity(),
			0,
			false,
			false,
			false,
		);
	}
}

/// References and payloads.
impl PrimIndexer<'_, '_> {
	fn eval_node_references(&mut self, node: u16) {
		if !self.can_contribute(node) {
			return;
		}

		let graph = self.graph();
		let layer_stack = graph.nodes[node as usize].layer_stack.clone();
		let path = graph.unshared[node as usize].site_path.clone();

		let mut expression_vars = BTreeSet::new();
		let (arcs, infos) = composer::compose_site_references(
			&layer_stack,
			&path,
			self.inputs.cache.resolver().as_ref(),
			&mut expression_vars,
		);
		self.record_expression_vars(layer_stack.identifier().to_string(), expression_vars);

		self.eval_ref_or_payload_arcs(node, ArcType::Reference, arcs, infos);
	}

	fn eval_node_payloads(&mut self, node: u16) {
		if !self.can_contribute(node) {
			return;
		}

		let graph = self.graph();
		let layer_stack = graph.nodes[node as usize].layer_stack.clone();
		let path = graph.unshared[node as usize].site_path.clone();

		let mut expression_vars = BTreeSet::new();
		let (arcs, infos) = composer::compose_site_payloads(
			&layer_stack,
			&path,
			self.inputs.cache.resolver().as_ref(),
			&mut expression_vars,
		);
		self.record_expression_vars(layer_stack.identifier().to_string(), expression_vars);

		if arcs.is_empty() {
			return;
		}

		// Mark that this prim index contains a payload; the arc itself is
		// only processed when the inclusion policy asks for it.
		self.graph_mut().has_payloads = true;

		// A payload that is an ancestral arc of a subroot reference or
		// payload target must always be composed: the ancestral index it
		// belongs to may have no explicit way to be included on its own.
		let is_ancestral_payload_of_subroot = self.previous_frame.is_some_and(|frame| {
			matches!(frame.arc_type, ArcType::Reference | ArcType::Payload)
				&& self.graph().node_site(0) != frame.requested_site
		});

		if !is_ancestral_payload_of_subroot {
			let Some(included) = &self.inputs.included_payloads else {
				debug!("payload not included, skipping");
				return;
			};

			let request_path = &self.root_site.path;
			let compose_payload = if let Some(predicate) = &self.inputs.include_payload_predicate {
				let included = predicate(request_path);
				self.outputs.payload_state = if included {
					PayloadState::IncludedByPredicate
				} else {
					PayloadState::ExcludedByPredicate
				};
				included
			} else {
				let included = included.contains(request_path);
				self.outputs.payload_state = if included {
					PayloadState::IncludedByIncludeSet
				} else {
					PayloadState::ExcludedByIncludeSet
				};
				included
			};

			if !compose_payload {
				debug!(path = %request_path, "payload excluded");
				return;
			}
		}

		self.eval_ref_or_payload_arcs(node, ArcType::Payload, arcs, infos);
	}

	// Reference and payload arcs are composed in essentially the same way.
	fn eval_ref_or_payload_arcs<T: ArcItem>(
		&mut self,
		node: u16,
		arc_type: ArcType,
		arcs: Vec<T>,
		infos: Vec<composer::SourceArcInfo>,
	) {
		for (arc_num, (arc, info)) in arcs.into_iter().zip(infos).enumerate() {
			let mut layer_offset = arc.layer_offset();
			let mut fail = false;

			// The target must be the default target or an absolute prim
			// path without variant selections.
			if !arc.prim_path().is_empty()
				&& !(arc.prim_path().is_prim_path()
					&& !arc.prim_path().contains_prim_variant_selection())
			{
				let error = PcpError::InvalidPrimPath {
					root_site: self.root_error_site(),
					site: self.node_error_site(node),
					prim_path: arc.prim_path().clone(),
					arc_type,
				};
				self.record_error(error);
				fail = true;
			}

			if !layer_offset.is_valid() || !layer_offset.inv().is_valid() {
				let error = PcpError::InvalidReferenceOffset {
					root_site: self.root_error_site(),
					source_layer: info.layer.identifier().to_string(),
					source_path: self.graph().unshared[node as usize].site_path.clone(),
					asset_path: info.authored_asset_path.clone(),
					offset: layer_offset,
					arc_type,
				};
				self.record_error(error);
				// Keep the arc; just drop the offset.
				layer_offset = sdf::Retiming::default();
			} else {
				layer_offset = info.layer_stack_offset * layer_offset;
			}

			if fail {
				continue;
			}

			let is_internal = arc.asset_path().is_empty();
			let target_layer_stack = if is_internal {
				self.graph().nodes[node as usize].layer_stack.clone()
			} else {
				let resolver = self.inputs.cache.resolver().clone();
				if resolver.is_muted(&info.authored_asset_path) {
					let error = PcpError::MutedAssetPath {
						root_site: self.root_error_site(),
						site: self.node_error_site(node),
						asset_path: info.authored_asset_path.clone(),
						arc_type,
					};
					self.record_error(error);
					continue;
				}

				let mut args = super::cache::FileFormatArguments::new();
				if arc_type == ArcType::Payload {
					// Dynamic file formats compose prim fields into their
					// arguments; record the consulted fields as
					// dependencies.
					let mut composed_fields = BTreeSet::new();
					{
						let graph = self.graph();
						let layer_stack = &graph.nodes[node as usize].layer_stack;
						let path = &graph.unshared[node as usize].site_path;
						let mut context = DynamicFileFormatContext::new(
							layer_stack,
							path,
							&mut composed_fields,
						);
						args = resolver.compose_dynamic_arguments(arc.asset_path(), &mut context);
					}
					self.outputs
						.dynamic_file_format_dependency
						.append(&mut composed_fields);
				}

				let Some(layer) =
					resolver.open_layer(arc.asset_path(), &args, &self.inputs.file_format_target)
				else {
					let error = PcpError::InvalidAssetPath {
						root_site: self.root_error_site(),
						site: self.node_error_site(node),
						asset_path: info.authored_asset_path.clone(),
						resolved_path: arc.asset_path().to_string(),
						arc_type,
					};
					self.record_error(error);
					continue;
				};

				let stack = self.inputs.cache.compute_layer_stack(layer);

				// Differing timecodes-per-second between the introducing
				// layer and the target stack scale the offset.
				let source_tcps = info.layer.timecodes_per_second();
				let target_tcps = stack.timecodes_per_second();
				if source_tcps != target_tcps {
					layer_offset.scale *= source_tcps / target_tcps;
				}

				stack
			};

			let mut direct_contributes = true;
			let prim_path = if arc.prim_path().is_empty() {
				let default_path = target_layer_stack.root_layer().default_prim_as_path();
				if default_path.is_empty() {
					let error = PcpError::UnresolvedPrimPath {
						root_site: self.root_error_site(),
						site: self.node_error_site(node),
						target_layer: target_layer_stack.identifier().to_string(),
						unresolved_path: sdf::Path::absolute_root_path(),
						arc_type,
					};
					self.record_error(error);

					// Keep an inert placeholder arc at the absolute root
					// so authoring a default prim later invalidates this
					// index.
					direct_contributes = false;
					sdf::Path::absolute_root_path()
				} else {
					default_path
				}
			} else {
				arc.prim_path().clone()
			};

			let mut map_expr =
				self.create_map_expression_for_arc(&prim_path, node, layer_offset);
			if is_internal {
				// Internal references maintain full namespace visibility
				// outside the source and target.
				map_expr = map_expr.add_root_identity();
			}

			// Only non-root prims have ancestors with scene description.
			let include_ancestral = !prim_path.is_root_prim_path();

			let target_site = LayerStackSite::new(target_layer_stack, prim_path);
			let new_node = self.add_arc(
				arc_type,
				node,
				node,
				&target_site,
				map_expr,
				arc_num,
				direct_contributes,
				include_ancestral,
				false,
			);

			// The arc must target a prim that exists in the referenced
			// layer stack. The node stays either way, for dependency
			// tracking.
			if let Some(new_node) = new_node
				&& !self.prim_spec_exists_under(new_node)
			{
				let error = PcpError::UnresolvedPrimPath {
					root_site: self.root_error_site(),
					site: self.node_error_site(node),
					target_layer: target_site.layer_stack.identifier().to_string(),
					unresolved_path: target_site.path.clone(),
					arc_type,
				};
				self.record_error(error);
			}
		}
	}
}

/// Class-based arcs: inherits, specializes and their implied propagation.
impl PrimIndexer<'_, '_> {
	fn eval_node_inherits(&mut self, node: u16) {
		if !self.can_contribute(node) {
			return;
		}

		let graph = self.graph();
		let layer_stack = graph.nodes[node as usize].layer_stack.clone();
		let path = graph.unshared[node as usize].site_path.clone();
		let inherits = composer::compose_site_inherits(&layer_stack, &path);

		self.add_class_based_arcs(node, inherits, ArcType::Inherit);
	}

	fn eval_node_specializes(&mut self, node: u16) {
		if !self.can_contribute(node) {
			return;
		}

		let graph = self.graph();
		let layer_stack = graph.nodes[node as usize].layer_stack.clone();
		let path = graph.unshared[node as usize].site_path.clone();
		let specializes = composer::compose_site_specializes(&layer_stack, &path);

		self.add_class_based_arcs(node, specializes, ArcType::Specialize);
	}

	fn add_class_based_arcs(&mut self, node: u16, class_paths: Vec<sdf::Path>, arc_type: ArcType) {
		for (arc_num, class_path) in class_paths.into_iter().enumerate() {
			if !class_path.is_empty()
				&& !(class_path.is_prim_path() && !class_path.contains_prim_variant_selection())
			{
				let error = PcpError::InvalidPrimPath {
					root_site: self.root_error_site(),
					site: self.node_error_site(node),
					prim_path: class_path,
					arc_type,
				};
				self.record_error(error);
				continue;
			}

			// The mapping for a class arc maps the class to the instance;
			// every other path maps to itself. Classes deliberately see
			// through reference namespace encapsulation.
			let map_expr = self
				.create_map_expression_for_arc(&class_path, node, sdf::Retiming::default())
				.add_root_identity();

			self.add_class_based_arc(arc_type, node, node, map_expr, arc_num, None);
		}
	}

	// Add a single class-based arc below `parent`. Returns the existing
	// node if the arc is already present (first-wins for equal sites).
	fn add_class_based_arc(
		&mut self,
		arc_type: ArcType,
		parent: u16,
		origin: u16,
		inherit_map: MapExpression,
		inherit_arc_num: usize,
		ignore_if_same_as_site: Option<&LayerStackSite>,
	) -> Option<u16> {
		let parent_path = self.graph().unshared[parent as usize].site_path.clone();

		// Map the parent's site back across the inherit to find the site
		// to inherit from. Using the mapping rather than the authored path
		// accounts for relocations applied along the way.
		let inherit_path = determine_inherit_path(&parent_path, &inherit_map);
		if inherit_path.is_empty() {
			// The parent site is outside the inherit's co-domain; the
			// class arc is not meaningful here. Not an error.
			return None;
		}

		let inherit_site = LayerStackSite::new(
			self.graph().nodes[parent as usize].layer_stack.clone(),
			inherit_path,
		);

		// The parent's arc type once the current subgraph lands in its
		// final graph; during recursion the frame knows it.
		let parent_arc_type =
			FrameCursor::new(self.graph(), parent, self.previous_frame)
				.arc_type()
				.unwrap_or(ArcType::Root);

		let origin_depth = self.graph().depth_below_introduction(origin);
		if let Some(existing) = self.find_matching_child(
			parent,
			parent_arc_type,
			&inherit_site,
			arc_type,
			&inherit_map,
			origin_depth,
		) {
			// Multiple arcs to the same site: the node that was populated
			// first stays in place.
			return Some(existing);
		}

		// An implied class propagated across a relocation or variant may
		// map onto its own source site. Such nodes are added to keep the
		// class propagating up the graph, but must not contribute
		// duplicate opinions.
		let should_contribute = inherit_site.path != parent_path
			&& ignore_if_same_as_site != Some(&inherit_site);

		// Placeholder duplicates must be added to keep propagation going;
		// everything else skips sites that already exist in the index.
		let skip_duplicate = should_contribute;

		// Only subroot classes have ancestral opinions to compute.
		let include_ancestral = should_contribute && !inherit_site.path.is_root_prim_path();

		self.add_arc(
			arc_type,
			parent,
			origin,
			&inherit_site,
			inherit_map,
			inherit_arc_num,
			should_contribute,
			include_ancestral,
			skip_duplicate,
		)
	}

	// Implied inherits under relocates map across sites that are not
	// meaningful on their own; their identity is the arc type, mapping and
	// origin depth instead of the site.
	fn find_matching_child(
		&self,
		parent: u16,
		parent_arc_type: ArcType,
		site: &LayerStackSite,
		arc_type: ArcType,
		map_to_parent: &MapExpression,
		origin_depth_below_introduction: u16,
	) -> Option<u16> {
		let graph = self.graph();
		graph.children(parent).into_iter().find(|&child| {
			let child_node = &graph.nodes[child as usize];
			if parent_arc_type == ArcType::Relocate {
				child_node.arc_type == arc_type
					&& child_node.map_to_parent == *map_to_parent
					&& graph.depth_below_introduction(child_node.origin_index)
						== origin_depth_below_introduction
			} else {
				graph.node_site(child) == *site
			}
		})
	}

	fn is_implied_class_based_arc(&self, node: u16) -> bool {
		let node_ref = &self.graph().nodes[node as usize];
		node_ref.arc_type.is_class_based() && node_ref.parent_index != node_ref.origin_index
	}

	// Given class-based node `n`, find the node where implied-class
	// processing must begin so the whole class hierarchy propagates as a
	// unit, accounting for ancestral inherits.
	fn find_starting_node_for_implied_classes(&self, node: u16) -> Option<u16> {
		let graph = self.graph();
		if !graph.nodes[node as usize].arc_type.is_class_based() {
			return None;
		}

		let mut start = node;
		while graph.nodes[start as usize].arc_type.is_class_based() {
			let (instance, class) = self.find_starting_node_of_class_hierarchy(start);
			start = instance;

			if graph.nodes[instance as usize].arc_type.is_class_based() {
				// There is an ancestral inherit. If the inherited class is
				// a namespace child of the ancestral class, the chain ends
				// here; otherwise keep walking to the start of the
				// ancestral hierarchy.
				let ancestral_class_path = graph.path_at_introduction(instance);
				let class_path = &graph.unshared[class as usize].site_path;
				if class_path.has_prefix(&ancestral_class_path) {
					break;
				}
			}
		}

		Some(start)
	}

	// Walk up consecutive class-based arcs introduced at the same
	// namespace depth; returns `(instance, first class in chain)`.
	fn find_starting_node_of_class_hierarchy(&self, node: u16) -> (u16, u16) {
		let graph = self.graph();
		let depth = graph.depth_below_introduction(node);

		let mut instance = node;
		let mut class = node;
		while graph.nodes[instance as usize].arc_type.is_class_based()
			&& graph.depth_below_introduction(instance) == depth
		{
			class = instance;
			instance = graph.nodes[instance as usize].parent_index;
			if instance == INVALID_NODE_INDEX {
				break;
			}
		}
		(instance, class)
	}

	fn find_starting_node_for_implied_specializes(&self, node: u16) -> Option<u16> {
		let graph = self.graph();
		let mut specializes_node = None;
		let mut current = node;
		while current != INVALID_NODE_INDEX
			&& graph.nodes[current as usize].parent_index != INVALID_NODE_INDEX
		{
			if graph.nodes[current as usize].arc_type.is_specialize() {
				specializes_node = Some(current);
			}
			current = graph.nodes[current as usize].parent_index;
		}
		specializes_node
	}

	fn eval_implied_classes(&mut self, node: u16) {
		if self.graph().nodes[node as usize].parent_index == INVALID_NODE_INDEX {
			return;
		}

		// Inherits beneath propagated specializes arcs propagate from the
		// origin of those arcs, keeping origin strength consistent; the
		// implied specializes task handles them.
		if self.is_propagated_specializes_node(node) {
			return;
		}

		if !self.has_class_based_child(node) {
			return;
		}

		// The mapping to the parent may have a restricted domain, e.g. a
		// reference maps only the referenced prim. Root classes must still
		// map across it, so add the root identity.
		let transfer = self.graph().nodes[node as usize]
			.map_to_parent
			.add_root_identity();
		let parent = self.graph().nodes[node as usize].parent_index;
		self.eval_implied_class_tree(parent, node, transfer, true);
	}

	// Check `src` for class-based children and add the corresponding
	// implied classes beneath `dest`.
	fn eval_implied_class_tree(
		&mut self,
		dest: u16,
		src: u16,
		transfer: MapExpression,
		src_is_start_of_tree: bool,
	) {
		// Classes on relocate nodes exist only as placeholders. Propagate
		// directly to the relocate's parent instead, and queue the
		// relocate node so ancestral hierarchies beginning under it are
		// picked up.
		if self.graph().nodes[dest as usize].arc_type == ArcType::Relocate {
			let new_transfer = self.graph().nodes[dest as usize]
				.map_to_parent
				.add_root_identity()
				.compose(&transfer);
			let dest_parent = self.graph().nodes[dest as usize].parent_index;
			self.eval_implied_class_tree(dest_parent, src, new_transfer, src_is_start_of_tree);

			self.tasks.add(Task::new(TaskType::EvalImpliedClasses, dest));
			return;
		}

		for src_child in self.graph().children(src) {
			if !self.graph().nodes[src_child as usize].arc_type.is_class_based() {
				continue;
			}

			// Distinguish true namespace descendants from the arc that
			// continues the chain dest -> src -> other: the continuation
			// is an ancestral class at the same depth below introduction,
			// and must not become a direct implied class of dest.
			if src_is_start_of_tree
				&& self.graph().nodes[src as usize].arc_type.is_class_based()
				&& self.graph().depth_below_introduction(src)
					== self.graph().depth_below_introduction(src_child)
			{
				continue;
			}

			let src_child_map = self.graph().nodes[src_child as usize].map_to_parent.clone();
			let dest_class_func = implied_class_function(&transfer, &src_child_map);

			// An implied class for this child may already have been
			// propagated; match by origin and mapping.
			let mut dest_child = self.graph().children(dest).into_iter().find(|&dc| {
				self.graph().nodes[dc as usize].origin_index == src_child
					&& self.graph().nodes[dc as usize].map_to_parent == dest_class_func
			});

			if dest_child.is_none() {
				// Use the same origin and sibling number as the source
				// child so the implied class keeps its effective strength
				// relative to other arcs.
				let src_child_site = self.graph().node_site(src_child);
				dest_child = self.add_class_based_arc(
					self.graph().nodes[src_child as usize].arc_type,
					dest,
					src_child,
					dest_class_func.clone(),
					self.graph().nodes[src_child as usize].sibling_num_at_origin as usize,
					Some(&src_child_site),
				);
			}

			// Recurse on nested classes to build up the full inherited
			// hierarchy.
			if let Some(dest_child) = dest_child
				&& self.has_class_based_child(src_child)
			{
				// Map the src child namespace to the dest child namespace:
				// up from the src child, across the transfer, down into
				// the dest child.
				let child_transfer = dest_class_func
					.inverse()
					.compose(&transfer.compose(&src_child_map));
				self.eval_implied_class_tree(dest_child, src_child, child_transfer, false);
			}
		}
	}
}

/// Implied specializes.
///
/// Specializes opinions are weakest. Each specializes subtree is copied to
/// the graph root, where strength-order traversal naturally places it
/// last. Arcs later discovered beneath the copy are propagated back to the
/// origin subtree so implied-class propagation and arc evaluation fire
/// with correct scoping, after which the subtree returns to the root.
impl PrimIndexer<'_, '_> {
	fn is_propagated_specializes_node(&self, node: u16) -> bool {
		let graph = self.graph();
		let node_ref = &graph.nodes[node as usize];
		node_ref.arc_type.is_specialize()
			&& node_ref.parent_index == 0
			&& node_ref.origin_index != INVALID_NODE_INDEX
			&& graph.node_site(node) == graph.node_site(node_ref.origin_index)
	}

	fn eval_implied_specializes(&mut self, node: u16) {
		if self.graph().nodes[node as usize].parent_index == INVALID_NODE_INDEX {
			return;
		}

		if self.is_propagated_specializes_node(node) {
			self.find_arcs_to_propagate_to_origin(node);
		} else {
			self.find_specializes_to_propagate_to_root(node);
		}
	}

	fn find_specializes_to_propagate_to_root(&mut self, node: u16) {
		// Placeholder implied arcs under relocate nodes are not valid
		// sources of opinions; stop the search there.
		let parent = self.graph().nodes[node as usize].parent_index;
		if parent != INVALID_NODE_INDEX {
			let is_relocates_placeholder = parent
				!= self.graph().nodes[node as usize].origin_index
				&& self.graph().nodes[parent as usize].arc_type == ArcType::Relocate
				&& self.graph().node_site(parent) == self.graph().node_site(node);
			if is_relocates_placeholder {
				return;
			}
		}

		if self.graph().nodes[node as usize].arc_type.is_specialize() {
			// Propagation back to the origin leaves implied specializes
			// inert; force the flag clear so the copy at the root does not
			// inherit it.
			self.graph_mut().nodes[node as usize].inert = false;

			let map_to_root = self.graph().map_to_root(node);
			self.propagate_specializes_tree_to_root(0, node, map_to_root, node);
		}

		for child in self.graph().children(node) {
			self.find_specializes_to_propagate_to_root(child);
		}
	}

	fn propagate_specializes_tree_to_root(
		&mut self,
		parent_node: u16,
		src: u16,
		map_to_parent: MapExpression,
		src_tree_root: u16,
	) {
		// Skip implied specializes tasks for the propagated node, or it
		// would bounce straight back to its originating subtree. The
		// expressed arc tasks still run for nodes newly placed at the
		// root.
		let new_node =
			self.propagate_node_to_parent(parent_node, src, true, false, map_to_parent, src_tree_root);
		let Some(new_node) = new_node else {
			return;
		};

		for child in self.graph().children(src) {
			if !self.graph().nodes[child as usize].arc_type.is_specialize() {
				let child_map = self.graph().nodes[child as usize].map_to_parent.clone();
				self.propagate_specializes_tree_to_root(new_node, child, child_map, src_tree_root);
			}
		}
	}

	fn find_arcs_to_propagate_to_origin(&mut self, node: u16) {
		let origin = self.graph().nodes[node as usize].origin_index;
		for child in self.graph().children(node) {
			let child_map = self.graph().nodes[child as usize].map_to_parent.clone();
			self.propagate_arcs_to_origin(origin, child, child_map, node);
		}
	}

	fn propagate_arcs_to_origin(
		&mut self,
		parent_node: u16,
		src: u16,
		map_to_parent: MapExpression,
		src_tree_root: u16,
	) {
		// Implied specializes tasks stay enabled here: a specializes arc
		// among the propagated nodes must itself reach the root later.
		// Expressed arc tasks are skipped so the already-composed subtree
		// does not queue duplicates.
		let new_node = self.propagate_node_to_parent(
			parent_node,
			src,
			false,
			true,
			map_to_parent,
			src_tree_root,
		);
		let Some(new_node) = new_node else {
			return;
		};

		for child in self.graph().children(src) {
			let child_map = self.graph().nodes[child as usize].map_to_parent.clone();
			self.propagate_arcs_to_origin(new_node, child, child_map, src_tree_root);
		}
	}

	fn propagate_node_to_parent(
		&mut self,
		dst_parent: u16,
		src: u16,
		skip_implied_specializes: bool,
		skip_expressed_arc_tasks: bool,
		map_to_parent: MapExpression,
		src_tree_root: u16,
	) -> Option<u16> {
		if self.graph().nodes[src as usize].parent_index == dst_parent {
			return Some(src);
		}

		let src_site = self.graph().node_site(src);
		let src_arc_type = self.graph().nodes[src as usize].arc_type;
		let mut new_node = self.find_matching_child(
			dst_parent,
			self.graph().nodes[dst_parent as usize].arc_type,
			&src_site,
			src_arc_type,
			&map_to_parent,
			self.graph().depth_below_introduction(src),
		);

		if new_node.is_none() {
			// Only propagate implied class arcs whose origin lies outside
			// the subtree being moved; the rest are re-derived when
			// implied classes are evaluated on the propagated subtree.
			let src_is_implied_class = self.is_implied_class_based_arc(src);
			let origin_in_subtree = self
				.graph()
				.is_node_in_subtree(self.graph().nodes[src as usize].origin_index, src_tree_root);

			if !src_is_implied_class || !origin_in_subtree {
				let namespace_depth = if src == src_tree_root {
					self.graph().unshared[dst_parent as usize]
						.site_path
						.non_variant_element_count()
				} else {
					self.graph().nodes[src as usize].namespace_depth as usize
				};

				let origin = if src == src_tree_root || src_is_implied_class {
					src
				} else {
					dst_parent
				};

				let direct_contributes = !self.graph().nodes[src as usize].inert;
				new_node = self.add_arc_full(
					src_arc_type,
					dst_parent,
					origin,
					&src_site,
					map_to_parent,
					self.graph().nodes[src as usize].sibling_num_at_origin as usize,
					namespace_depth,
					direct_contributes,
					false,
					false,
					skip_implied_specializes,
					skip_expressed_arc_tasks,
				);
			}
		}

		match new_node {
			Some(new_node) => {
				let (inert, has_symmetry, permission, restricted) = {
					let src_ref = &self.graph().nodes[src as usize];
					(
						src_ref.inert,
						src_ref.has_symmetry,
						src_ref.permission,
						src_ref.restricted,
					)
				};
				{
					let node_ref = &mut self.graph_mut().nodes[new_node as usize];
					node_ref.inert = inert;
					node_ref.has_symmetry = has_symmetry;
					node_ref.permission = permission;
					node_ref.restricted = restricted;
				}
				// The source's opinions now flow through the copy.
				self.graph_mut().nodes[src as usize].inert = true;
				Some(new_node)
			}
			None => {
				self.inert_subtree(src);
				None
			}
		}
	}
}

/// Variants.
impl PrimIndexer<'_, '_> {
	fn eval_node_variant_sets(&mut self, node: u16) {
		if !self.can_contribute(node) {
			return;
		}

		let graph = self.graph();
		let layer_stack = graph.nodes[node as usize].layer_stack.clone();
		let path = graph.unshared[node as usize].site_path.clone();
		let vset_names = composer::compose_site_variant_sets(&layer_stack, &path);

		for (vset_num, vset_name) in vset_names.into_iter().enumerate() {
			self.tasks.add(Task::variant(
				TaskType::EvalNodeVariantAuthored,
				node,
				vset_name,
				vset_num as u16,
			));
		}
	}

	fn eval_node_variant_authored(&mut self, node: u16, vset: &str, vset_num: u16) {
		if !self.can_contribute(node) {
			return;
		}

		let graph = self.graph();
		let layer_stack = graph.nodes[node as usize].layer_stack.clone();
		let path = graph.unshared[node as usize].site_path.clone();

		let options = composer::compose_site_variant_set_options(&layer_stack, &path, vset);
		let fallback = self.choose_best_fallback_among_options(vset, &options);

		// Resolve the authored selection by walking everything composed so
		// far, across stack frames, in strength order.
		let (selection, consulted) = {
			let graph = &self.outputs.prim_index.graph;
			let mut consulted = Vec::new();
			let selection = compose_variant_selection(
				graph,
				self.previous_frame,
				self.ancestor_recursion_depth,
				node,
				&path.strip_all_variant_selections(),
				vset,
				&mut consulted,
			);
			(selection, consulted)
		};
		for (layer_stack_id, vars) in consulted {
			self.record_expression_vars(layer_stack_id, vars);
		}

		let (vsel, vsel_source) = match selection {
			Some((vsel, source)) => (vsel, Some(source)),
			None => (String::new(), None),
		};

		if self.should_use_variant_fallback(vset, &vsel, &fallback, vsel_source.as_ref()) {
			debug!(vset, "deferring to variant fallback");
			self.tasks.add(Task::variant(
				TaskType::EvalNodeVariantFallback,
				node,
				vset.to_string(),
				vset_num,
			));
			return;
		}

		if vsel.is_empty() {
			// No selection; leave a marker so a later retry can revisit.
			self.tasks.add(Task::variant(
				TaskType::EvalNodeVariantNoneFound,
				node,
				vset.to_string(),
				vset_num,
			));
			return;
		}

		self.add_variant_arc(node, vset, vset_num, &vsel);
	}

	fn eval_node_variant_fallback(&mut self, node: u16, vset: &str, vset_num: u16) {
		if !self.can_contribute(node) {
			return;
		}

		let graph = self.graph();
		let layer_stack = graph.nodes[node as usize].layer_stack.clone();
		let path = graph.unshared[node as usize].site_path.clone();

		let options = composer::compose_site_variant_set_options(&layer_stack, &path, vset);
		let vsel = self.choose_best_fallback_among_options(vset, &options);

		if vsel.is_empty() {
			self.tasks.add(Task::variant(
				TaskType::EvalNodeVariantNoneFound,
				node,
				vset.to_string(),
				vset_num,
			));
			return;
		}

		self.add_variant_arc(node, vset, vset_num, &vsel);
	}

	fn choose_best_fallback_among_options(
		&self,
		vset: &str,
		options: &BTreeSet<String>,
	) -> String {
		if let Some(fallbacks) = self.inputs.variant_fallbacks.get(vset) {
			for fallback in fallbacks {
				if options.contains(fallback) {
					return fallback.clone();
				}
			}
		}
		String::new()
	}

	fn should_use_variant_fallback(
		&self,
		vset: &str,
		vsel: &str,
		fallback: &str,
		vsel_source: Option<&VselSource>,
	) -> bool {
		if fallback.is_empty() {
			return false;
		}

		if vsel.is_empty() {
			return true;
		}

		// Only the legacy "standin" set lets the fallback win over an
		// authored selection.
		if vset != "standin" || new_default_standin_behavior() {
			return false;
		}

		let Some(source) = vsel_source else {
			return false;
		};

		// A variant node carrying this set's selection means the decision
		// was already made (and the policy already applied).
		if source.is_variant_for_vset {
			return false;
		}

		// Authored selections beneath a payload defer to the fallback.
		if source.beneath_payload {
			return true;
		}

		// Selections made in a session layer stand.
		let root_stack = &self.root_site.layer_stack;
		for layer in root_stack.session_layers() {
			if let Some(value) = layer.field(&self.root_site.path, &sdf::FIELD_KEYS.variant_selection)
				&& let Some(selections) = value.get::<sdf::VariantSelectionMap>()
				&& selections.get(vset).map(String::as_str) == Some(vsel)
			{
				return false;
			}
		}

		source.arc_type != ArcType::Root
	}

	fn add_variant_arc(&mut self, node: u16, vset: &str, vset_num: u16, vsel: &str) {
		// Variants do not remap namespace; they branch into a different
		// section of layer storage. The site carries the selection, the
		// mapping is identity.
		let graph = self.graph();
		let layer_stack = graph.nodes[node as usize].layer_stack.clone();
		let variant_path = graph.unshared[node as usize]
			.site_path
			.append_variant_selection(vset, vsel);

		let added = self.add_arc(
			ArcType::Variant,
			node,
			node,
			&LayerStackSite::new(layer_stack, variant_path),
			MapExpression::identity(),
			vset_num as usize,
			true,
			false,
			false,
		);

		if added.is_some() {
			// Expanding a variant set may introduce new authored
			// selections; retry pending variant decisions as authored.
			self.tasks.retry_variant_tasks();
		}
	}
}

fn determine_inherit_path(parent_path: &sdf::Path, inherit_map: &MapExpression) -> sdf::Path {
	if !parent_path.contains_prim_variant_selection() {
		return inherit_map.map_target_to_source(parent_path);
	}

	// Variant selections address layer storage and must never appear in
	// mapping-function paths: strip them, map, then re-attach.
	let mut variant_path = parent_path.clone();
	while !variant_path.is_empty() && !variant_path.is_prim_variant_selection_path() {
		variant_path = variant_path.parent_path();
	}

	inherit_map
		.map_target_to_source(&parent_path.strip_all_variant_selections())
		.replace_prefix(&variant_path.strip_all_variant_selections(), &variant_path)
}

/// The effective map function for an implied class arc: conjugate the
/// class mapping by the transfer function that carries the arc across to
/// the destination parent.
fn implied_class_function(transfer: &MapExpression, class_arc: &MapExpression) -> MapExpression {
	if transfer.is_constant_identity() {
		return class_arc.clone();
	}

	transfer
		.compose(&class_arc.compose(&transfer.inverse()))
		.add_root_identity()
}

// Walk the constructed graphs strong-to-weak, across stack frames, for an
// authored opinion on `(path, vset)`. Returns the selection and its
// provenance.
fn compose_variant_selection(
	graph: &PrimIndexGraph,
	previous_frame: Option<&StackFrame<'_>>,
	ancestor_recursion_depth: u32,
	node: u16,
	path_in_node: &sdf::Path,
	vset: &str,
	consulted: &mut Vec<(String, BTreeSet<String>)>,
) -> Option<(String, VselSource)> {
	// Translate up to the root of the graph under construction.
	let path_in_root = if node != 0 {
		graph.map_to_root(node).map_source_to_target(path_in_node)
	} else {
		path_in_node.clone()
	};
	if path_in_root.is_empty() {
		return None;
	}

	// A variant node at the same effective namespace depth carrying a
	// selection for this set is a prior decision; reuse it.
	if let Some(found) =
		find_prior_variant_selection(graph, 0, &path_in_root, ancestor_recursion_depth, vset)
	{
		return Some(found);
	}

	// Track the hops needed to traverse enclosing partial graphs as if the
	// prim index were fully constructed.
	let mut hops: Vec<(&StackFrame<'_>, &PrimIndexGraph)> = Vec::new();
	let mut current_graph = graph;
	let mut current_root_path = path_in_root;
	let mut frame_iter = previous_frame;
	while let Some(frame) = frame_iter {
		// The path may not translate across this frame; then no site
		// beyond it can hold a relevant opinion.
		let path_in_prev = frame
			.arc_map_to_parent
			.map_source_to_target(&current_root_path);
		if path_in_prev.is_empty() {
			break;
		}

		let root_path_in_prev = if frame.parent_node != 0 {
			frame
				.graph
				.map_to_root(frame.parent_node)
				.map_source_to_target(&path_in_prev)
		} else {
			path_in_prev
		};
		if root_path_in_prev.is_empty() {
			break;
		}

		if let Some(found) = find_prior_variant_selection(
			frame.graph,
			0,
			&root_path_in_prev,
			ancestor_recursion_depth,
			vset,
		) {
			return Some(found);
		}

		hops.push((frame, current_graph));
		current_graph = frame.graph;
		current_root_path = root_path_in_prev;
		frame_iter = frame.previous;
	}

	compose_variant_selection_across_frames(
		current_graph,
		0,
		&current_root_path,
		vset,
		&mut hops,
		consulted,
	)
}

fn compose_variant_selection_across_frames(
	graph: &PrimIndexGraph,
	node: u16,
	path_in_node: &sdf::Path,
	vset: &str,
	hops: &mut Vec<(&StackFrame<'_>, &PrimIndexGraph)>,
	consulted: &mut Vec<(String, BTreeSet<String>)>,
) -> Option<(String, VselSource)> {
	if let Some(found) = compose_variant_selection_for_node(graph, node, path_in_node, vset, consulted)
	{
		return Some(found);
	}

	// At the node a pending sub-index hangs from, descend into the inner
	// graph to continue the strength-order walk.
	if let Some(&(frame, child_graph)) = hops.last()
		&& std::ptr::eq(graph, frame.graph)
		&& node == frame.parent_node
	{
		hops.pop();
		let path_in_child = frame.arc_map_to_parent.map_target_to_source(path_in_node);
		if path_in_child.is_empty() {
			return None;
		}
		return compose_variant_selection_across_frames(
			child_graph,
			0,
			&path_in_child,
			vset,
			hops,
			consulted,
		);
	}

	for child in graph.children(node) {
		let path_in_child = graph.nodes[child as usize]
			.map_to_parent
			.map_target_to_source(path_in_node);
		if path_in_child.is_empty() {
			continue;
		}
		if let Some(found) = compose_variant_selection_across_frames(
			graph,
			child,
			&path_in_child,
			vset,
			hops,
			consulted,
		) {
			return Some(found);
		}
	}

	None
}

fn compose_variant_selection_for_node(
	graph: &PrimIndexGraph,
	node: u16,
	path_in_node: &sdf::Path,
	vset: &str,
	consulted: &mut Vec<(String, BTreeSet<String>)>,
) -> Option<(String, VselSource)> {
	let node_ref = &graph.nodes[node as usize];
	if !node_ref.can_contribute_specs() {
		return None;
	}

	// `path_in_node` is a namespace path. To reach the storage site of a
	// variant node, re-attach the node's variant selections.
	let node_path = &graph.unshared[node as usize].site_path;
	let site_path = if node_ref.arc_type == ArcType::Variant {
		path_in_node.replace_prefix(&node_path.strip_all_variant_selections(), node_path)
	} else {
		path_in_node.clone()
	};

	let mut vars = BTreeSet::new();
	let found =
		composer::compose_site_variant_selection(&node_ref.layer_stack, &site_path, vset, &mut vars);
	if !vars.is_empty() {
		consulted.push((node_ref.layer_stack.identifier().to_string(), vars));
	}

	// An authored empty selection counts: it explicitly selects no
	// variant.
	found.map(|(vsel, _)| {
		let source = VselSource {
			arc_type: node_ref.arc_type,
			is_variant_for_vset: node_path
				.variant_selection()
				.is_some_and(|(set, _)| set == vset),
			beneath_payload: node_beneath_payload(graph, node),
		};
		(vsel, source)
	})
}

fn node_beneath_payload(graph: &PrimIndexGraph, node: u16) -> bool {
	let mut current = node;
	while current != INVALID_NODE_INDEX {
		if graph.nodes[current as usize].arc_type == ArcType::Payload {
			return true;
		}
		current = graph.nodes[current as usize].parent_index;
	}
	false
}

fn find_prior_variant_selection(
	graph: &PrimIndexGraph,
	node: u16,
	path_in_root: &sdf::Path,
	ancestor_recursion_depth: u32,
	vset: &str,
) -> Option<(String, VselSource)> {
	let node_ref = &graph.nodes[node as usize];
	if node_ref.arc_type == ArcType::Variant
		&& graph.depth_below_introduction(node) as u32 == ancestor_recursion_depth
	{
		let path_at_introduction = graph.path_at_introduction(node);
		if let Some((set, sel)) = path_at_introduction.variant_selection()
			&& set == vset
		{
			// The node must actually represent the prim whose selection is
			// being resolved, not another prim with a same-named set.
			let path_in_node = graph.map_to_root(node).map_target_to_source(path_in_root);
			if path_in_node.is_empty() {
				// It will not translate to any child either.
				return None;
			}
			if path_at_introduction.prim_path() == path_in_node {
				let selection = sel.to_string();
				return Some((
					selection,
					VselSource {
						arc_type: ArcType::Variant,
						is_variant_for_vset: true,
						beneath_payload: node_beneath_payload(graph, node),
					},
				));
			}
		}
	}

	for child in graph.children(node) {
		if let Some(found) = find_prior_variant_selection(
			graph,
			child,
			path_in_root,
			ancestor_recursion_depth,
			vset,
		) {
			return Some(found);
		}
	}
	None
}
