use super::cache::AssetResolver;
use super::map_expression::{MapExpression, MapFunction};
use crate::sdf;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Represents a stack of layers that contribute opinions to composition.
#[derive(Debug)]
pub struct LayerStack {
	/// Layers in the stack, ordered from strongest (index 0) to weakest
	/// (last index). The first `session_layer_count` entries are session
	/// layers; the layer after them is the stack's root layer.
	pub layers: Vec<Arc<sdf::Layer>>,
	pub layer_offsets: Vec<sdf::Retiming>,
	session_layer_count: usize,
	relocates_source_to_target: BTreeMap<sdf::Path, sdf::Path>,
	relocates_target_to_source: BTreeMap<sdf::Path, sdf::Path>,
	expression_variables: BTreeMap<String, String>,
	timecodes_per_second: f64,
}

impl LayerStack {
	pub fn new(root_layer: Arc<sdf::Layer>, resolver: &dyn AssetResolver) -> Self {
		Self::with_session(Vec::new(), root_layer, resolver)
	}

	pub fn with_session(
		session_layers: Vec<Arc<sdf::Layer>>,
		root_layer: Arc<sdf::Layer>,
		resolver: &dyn AssetResolver,
	) -> Self {
		let mut stack = Self {
			layers: Vec::new(),
			layer_offsets: Vec::new(),
			session_layer_count: 0,
			relocates_source_to_target: BTreeMap::new(),
			relocates_target_to_source: BTreeMap::new(),
			expression_variables: BTreeMap::new(),
			timecodes_per_second: root_layer.timecodes_per_second(),
		};

		for session_layer in session_layers {
			stack.build(session_layer, sdf::Retiming::default(), resolver);
		}
		stack.session_layer_count = stack.layers.len();

		stack.build(root_layer, sdf::Retiming::default(), resolver);
		stack.compute_relocates();
		stack.compute_expression_variables();
		stack
	}

	fn build(&mut self, layer: Arc<sdf::Layer>, offset: sdf::Retiming, resolver: &dyn AssetResolver) {
		self.layers.push(layer.clone());
		self.layer_offsets.push(offset);

		let sub_layers = layer.sub_layer_paths();
		let sub_layer_offsets = layer.sub_layer_offsets();

		for (i, sub_layer_path) in sub_layers.iter().enumerate() {
			let sub_offset = sub_layer_offsets
				.get(i)
				.copied()
				.unwrap_or_default();

			let combined_offset = offset * sub_offset;

			let resolved_path = resolver.resolve(&layer, sub_layer_path);
			if let Some(sub_layer) = resolver.open_layer(&resolved_path, &Default::default(), "") {
				self.build(sub_layer, combined_offset, resolver);
			}
		}
	}

	// Gather the authored relocates of every layer, strongest first. These
	// are the incremental relocates: each authored step is kept, rather than
	// collapsing chains into a single transitive entry.
	fn compute_relocates(&mut self) {
		for layer in &self.layers {
			for relocate in layer.relocates() {
				if self
					.relocates_source_to_target
					.contains_key(&relocate.source)
				{
					continue;
				}
				self.relocates_source_to_target
					.insert(relocate.source.clone(), relocate.target.clone());
				self.relocates_target_to_source
					.insert(relocate.target, relocate.source);
			}
		}
	}

	fn compute_expression_variables(&mut self) {
		// Strongest authored opinion per variable wins.
		for layer in &self.layers {
			for (name, value) in layer.expression_variables() {
				self.expression_variables.entry(name).or_insert(value);
			}
		}
	}
}

impl LayerStack {
	/// The identifier of the stack's root layer.
	pub fn identifier(&self) -> &str {
		self.layers[self.session_layer_count].identifier()
	}

	pub fn root_layer(&self) -> &Arc<sdf::Layer> {
		&self.layers[self.session_layer_count]
	}

	/// The session layers of this stack, strongest first.
	pub fn session_layers(&self) -> &[Arc<sdf::Layer>] {
		&self.layers[..self.session_layer_count]
	}

	pub fn timecodes_per_second(&self) -> f64 {
		self.timecodes_per_second
	}

	pub fn expression_variables(&self) -> &BTreeMap<String, String> {
		&self.expression_variables
	}

	/// The incremental relocates authored across this stack's layers,
	/// keyed by source path.
	pub fn incremental_relocates_source_to_target(&self) -> &BTreeMap<sdf::Path, sdf::Path> {
		&self.relocates_source_to_target
	}

	/// The incremental relocates authored across this stack's layers,
	/// keyed by target path.
	pub fn incremental_relocates_target_to_source(&self) -> &BTreeMap<sdf::Path, sdf::Path> {
		&self.relocates_target_to_source
	}

	/// Returns whether any relocate in this stack has its source at or
	/// beneath `path`.
	pub fn has_relocates_source_at_or_under(&self, path: &sdf::Path) -> bool {
		self.relocates_source_to_target
			.keys()
			.any(|source| source.has_prefix(path))
	}

	/// Build the map expression for the relocates that affect namespace at
	/// or below `path`, mapping pre-relocation paths to their relocated
	/// locations.
	pub fn relocates_expression_for_path(&self, path: &sdf::Path) -> MapExpression {
		let pairs: Vec<_> = self
			.relocates_source_to_target
			.iter()
			.filter(|(source, _)| source.has_prefix(path))
			.map(|(source, target)| (source.clone(), target.clone()))
			.collect();

		if pairs.is_empty() {
			MapExpression::identity()
		} else {
			MapExpression::constant(
				MapFunction::new(pairs, sdf::Retiming::default()).add_root_identity(),
			)
		}
	}
}
