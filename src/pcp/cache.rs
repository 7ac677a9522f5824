use super::layer_stack::LayerStack;
use crate::{sdf, tf, vt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

/// Arguments passed to a file format when opening a layer.
pub type FileFormatArguments = BTreeMap<String, String>;

/// Resolves and opens the layers named by composition arcs.
///
/// Layer I/O and file-format plugins live behind this trait; the indexer
/// only ever asks for anchored resolution and opened layers.
pub trait AssetResolver: Send + Sync {
	/// Anchor `asset_path` relative to the layer that authored it and
	/// return the resolved identifier.
	fn resolve(&self, anchor: &sdf::Layer, asset_path: &str) -> String;

	/// Returns whether the given asset path has been muted by the consumer.
	fn is_muted(&self, _asset_path: &str) -> bool {
		false
	}

	/// Open the layer at a resolved identifier. Returns `None` if the layer
	/// cannot be opened.
	fn open_layer(
		&self,
		resolved_path: &str,
		args: &FileFormatArguments,
		file_format_target: &str,
	) -> Option<Arc<sdf::Layer>>;

	/// Compose dynamic file format arguments for the asset at `asset_path`.
	/// Only payload arcs consult this; the context lets the format read
	/// composed fields and records them for dependency tracking.
	fn compose_dynamic_arguments(
		&self,
		_asset_path: &str,
		_context: &mut DynamicFileFormatContext<'_>,
	) -> FileFormatArguments {
		FileFormatArguments::new()
	}
}

/// Context handed to a file format while composing dynamic arguments.
/// Field reads flow through here so the consulted field names can be
/// reported as dependencies.
pub struct DynamicFileFormatContext<'a> {
	layer_stack: &'a LayerStack,
	path: &'a sdf::Path,
	composed_fields: &'a mut BTreeSet<String>,
}

impl<'a> DynamicFileFormatContext<'a> {
	pub(crate) fn new(
		layer_stack: &'a LayerStack,
		path: &'a sdf::Path,
		composed_fields: &'a mut BTreeSet<String>,
	) -> Self {
		Self {
			layer_stack,
			path,
			composed_fields,
		}
	}

	/// Return the strongest opinion for `field` at the context's site.
	pub fn compose_field(&mut self, field: &tf::Token) -> Option<vt::Value> {
		self.composed_fields.insert(field.to_string());
		self.layer_stack
			.layers
			.iter()
			.find_map(|layer| layer.field(self.path, field))
	}
}

/// Provides layer stacks to the indexer, deduplicating by root-layer
/// identifier so that repeated arcs to the same asset share one stack and
/// site identity comparisons hold.
pub struct PcpCache {
	resolver: Arc<dyn AssetResolver>,
	layer_stacks: Mutex<HashMap<String, Arc<LayerStack>>>,
}

impl PcpCache {
	pub fn new(resolver: Arc<dyn AssetResolver>) -> Self {
		Self {
			resolver,
			layer_stacks: Mutex::new(HashMap::new()),
		}
	}

	pub fn resolver(&self) -> &Arc<dyn AssetResolver> {
		&self.resolver
	}

	pub fn compute_layer_stack(&self, root_layer: Arc<sdf::Layer>) -> Arc<LayerStack> {
		let key = root_layer.identifier().to_string();

		{
			let stacks = self.layer_stacks.lock().unwrap();
			if let Some(stack) = stacks.get(&key) {
				return stack.clone();
			}
		}

		let stack = Arc::new(LayerStack::new(root_layer, self.resolver.as_ref()));

		let mut stacks = self.layer_stacks.lock().unwrap();
		if let Some(existing) = stacks.get(&key) {
			return existing.clone();
		}
		stacks.insert(key, stack.clone());

		stack
	}
}

impl std::fmt::Debug for PcpCache {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PcpCache").finish_non_exhaustive()
	}
}
