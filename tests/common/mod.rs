use opencomp_rs::{pcp, sdf, tf, vt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

/// Builds an in-memory layer, tracking authored prims so child lists are
/// populated the way a file-backed layer would carry them.
pub struct LayerBuilder {
	identifier: String,
	data: sdf::InMemoryData,
	prims: Vec<sdf::Path>,
}

impl LayerBuilder {
	pub fn new(identifier: &str) -> Self {
		Self {
			identifier: identifier.to_string(),
			data: sdf::InMemoryData::new(),
			prims: Vec::new(),
		}
	}

	pub fn prim(mut self, path: &str) -> Self {
		let path = sdf::Path::from(path);
		let spec_type = if path.is_prim_variant_selection_path() {
			sdf::SpecType::Variant
		} else {
			sdf::SpecType::Prim
		};
		self.data.add_spec(path.clone(), spec_type);
		self.prims.push(path);
		self
	}

	pub fn field(mut self, path: &str, field: &tf::Token, value: vt::Value) -> Self {
		self.data.set(sdf::Path::from(path), field.clone(), value);
		self
	}

	pub fn references(self, path: &str, references: Vec<sdf::Reference>) -> Self {
		self.field(
			path,
			&sdf::FIELD_KEYS.references,
			vt::Value::ReferenceListOp(sdf::ReferenceListOp::prepended(references)),
		)
	}

	pub fn payloads(self, path: &str, payloads: Vec<sdf::Payload>) -> Self {
		self.field(
			path,
			&sdf::FIELD_KEYS.payload,
			vt::Value::PayloadListOp(sdf::PayloadListOp::prepended(payloads)),
		)
	}

	pub fn inherits(self, path: &str, class_paths: &[&str]) -> Self {
		let paths = class_paths.iter().map(|p| sdf::Path::from(*p)).collect();
		self.field(
			path,
			&sdf::FIELD_KEYS.inherit_paths,
			vt::Value::PathListOp(sdf::PathListOp::prepended(paths)),
		)
	}

	pub fn specializes(self, path: &str, class_paths: &[&str]) -> Self {
		let paths = class_paths.iter().map(|p| sdf::Path::from(*p)).collect();
		self.field(
			path,
			&sdf::FIELD_KEYS.specializes,
			vt::Value::PathListOp(sdf::PathListOp::prepended(paths)),
		)
	}

	pub fn variant_sets(self, path: &str, names: &[&str]) -> Self {
		let names = names.iter().map(|n| n.to_string()).collect();
		self.field(
			path,
			&sdf::FIELD_KEYS.variant_set_names,
			vt::Value::StringListOp(sdf::StringListOp::prepended(names)),
		)
	}

	pub fn variant_selections(self, path: &str, selections: &[(&str, &str)]) -> Self {
		let map: BTreeMap<String, String> = selections
			.iter()
			.map(|(set, sel)| (set.to_string(), sel.to_string()))
			.collect();
		self.field(path, &sdf::FIELD_KEYS.variant_selection, vt::Value::StringMap(map))
	}

	pub fn default_prim(self, name: &str) -> Self {
		self.field(
			"/",
			&sdf::FIELD_KEYS.default_prim,
			vt::Value::Token(tf::Token::new(name)),
		)
	}

	pub fn relocates(self, pairs: &[(&str, &str)]) -> Self {
		let relocates = pairs
			.iter()
			.map(|(source, target)| sdf::Relocate {
				source: sdf::Path::from(*source),
				target: sdf::Path::from(*target),
			})
			.collect();
		self.field(
			"/",
			&sdf::FIELD_KEYS.layer_relocates,
			vt::Value::Relocates(relocates),
		)
	}

	pub fn sub_layers(self, paths: &[&str]) -> Self {
		let paths = paths.iter().map(|p| p.to_string()).collect();
		self.field("/", &sdf::FIELD_KEYS.sub_layers, vt::Value::StringVec(paths))
	}

	pub fn permission(self, path: &str, permission: sdf::Permission) -> Self {
		self.field(path, &sdf::FIELD_KEYS.permission, vt::Value::Permission(permission))
	}

	pub fn build(mut self) -> Arc<sdf::Layer> {
		let mut children: BTreeMap<sdf::Path, Vec<tf::Token>> = BTreeMap::new();
		for prim in &self.prims {
			if !prim.is_prim_path() {
				continue;
			}
			let names = children.entry(prim.parent_path()).or_default();
			let name = prim.name_token();
			if !names.contains(&name) {
				names.push(name);
			}
		}
		for (parent, names) in children {
			self.data.set(
				parent,
				sdf::CHILDREN_KEYS.prim_children.clone(),
				vt::Value::TokenVec(names),
			);
		}

		Arc::new(sdf::Layer::new(self.identifier, Box::new(self.data)))
	}
}

pub fn reference(asset_path: &str, prim_path: &str) -> sdf::Reference {
	sdf::Reference {
		asset_path: asset_path.to_string(),
		prim_path: sdf::Path::from(prim_path),
		..Default::default()
	}
}

pub fn payload(asset_path: &str, prim_path: &str) -> sdf::Payload {
	sdf::Payload {
		asset_path: asset_path.to_string(),
		prim_path: sdf::Path::from(prim_path),
		..Default::default()
	}
}

/// Serves registered in-memory layers by identifier.
#[derive(Default)]
pub struct TestResolver {
	layers: Mutex<BTreeMap<String, Arc<sdf::Layer>>>,
	muted: Mutex<BTreeSet<String>>,
}

impl TestResolver {
	pub fn add_layer(&self, layer: Arc<sdf::Layer>) {
		self.layers
			.lock()
			.unwrap()
			.insert(layer.identifier().to_string(), layer);
	}

	pub fn mute(&self, asset_path: &str) {
		self.muted.lock().unwrap().insert(asset_path.to_string());
	}
}

impl pcp::AssetResolver for TestResolver {
	fn resolve(&self, _anchor: &sdf::Layer, asset_path: &str) -> String {
		asset_path.to_string()
	}

	fn is_muted(&self, asset_path: &str) -> bool {
		self.muted.lock().unwrap().contains(asset_path)
	}

	fn open_layer(
		&self,
		resolved_path: &str,
		_args: &pcp::FileFormatArguments,
		_file_format_target: &str,
	) -> Option<Arc<sdf::Layer>> {
		self.layers.lock().unwrap().get(resolved_path).cloned()
	}
}

/// A scene of in-memory layers plus the cache used to index them.
pub struct Scene {
	pub resolver: Arc<TestResolver>,
	pub cache: Arc<pcp::PcpCache>,
}

impl Scene {
	pub fn new() -> Self {
		let resolver = Arc::new(TestResolver::default());
		let cache = Arc::new(pcp::PcpCache::new(resolver.clone()));
		Self { resolver, cache }
	}

	pub fn add_layer(&self, layer: Arc<sdf::Layer>) {
		self.resolver.add_layer(layer);
	}

	pub fn layer_stack(&self, identifier: &str) -> Arc<pcp::LayerStack> {
		let layer = self
			.layers()
			.get(identifier)
			.cloned()
			.unwrap_or_else(|| panic!("no layer registered as {identifier}"));
		self.cache.compute_layer_stack(layer)
	}

	fn layers(&self) -> BTreeMap<String, Arc<sdf::Layer>> {
		self.resolver.layers.lock().unwrap().clone()
	}

	pub fn inputs(&self) -> pcp::PrimIndexInputs {
		pcp::PrimIndexInputs::new(self.cache.clone())
	}

	pub fn compute(&self, root_layer: &str, path: &str) -> pcp::PrimIndexOutputs {
		self.compute_with(root_layer, path, &self.inputs())
	}

	pub fn compute_with(
		&self,
		root_layer: &str,
		path: &str,
		inputs: &pcp::PrimIndexInputs,
	) -> pcp::PrimIndexOutputs {
		pcp::compute_prim_index(
			self.layer_stack(root_layer),
			sdf::Path::from(path),
			inputs,
		)
	}
}

/// The index's strength-ordered sites as `(layer stack identifier, path)`
/// string pairs, for compact assertions.
pub fn site_strings(index: &pcp::PrimIndex) -> Vec<(String, String)> {
	index
		.sites_in_strength_order()
		.into_iter()
		.map(|site| {
			(
				site.layer_stack.identifier().to_string(),
				site.path.to_string(),
			)
		})
		.collect()
}

pub fn child_names(index: &pcp::PrimIndex) -> Vec<String> {
	index
		.compute_prim_child_names()
		.0
		.into_iter()
		.map(|name| name.to_string())
		.collect()
}
