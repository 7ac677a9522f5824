use crate::{sdf, tf, vt};
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone)]
struct Spec {
	spec_type: sdf::SpecType,
	fields: BTreeMap<tf::Token, vt::Value>,
}

/// In-memory scene description storage, used for programmatically authored
/// layers.
#[derive(Debug, Default)]
pub struct InMemoryData {
	specs: BTreeMap<sdf::Path, Spec>,
}

impl InMemoryData {
	pub fn new() -> Self {
		let mut data = Self::default();
		data.add_spec(sdf::Path::absolute_root_path(), sdf::SpecType::PseudoRoot);
		data
	}

	pub fn add_spec(&mut self, path: sdf::Path, spec_type: sdf::SpecType) {
		self.specs.entry(path).or_default().spec_type = spec_type;
	}

	pub fn set(&mut self, path: sdf::Path, field: tf::Token, value: vt::Value) {
		self.specs.entry(path).or_default().fields.insert(field, value);
	}
}

impl sdf::AbstractData for InMemoryData {
	fn spec_type(&self, path: &sdf::Path) -> Option<sdf::SpecType> {
		self.specs.get(path).map(|spec| spec.spec_type)
	}

	fn get(&self, path: &sdf::Path, field: &tf::Token) -> Option<vt::Value> {
		self.specs
			.get(path)
			.and_then(|spec| spec.fields.get(field))
			.cloned()
	}

	fn list(&self, path: &sdf::Path) -> Vec<&tf::Token> {
		self.specs
			.get(path)
			.map(|spec| spec.fields.keys().collect())
			.unwrap_or_default()
	}

	fn visit_specs(&self) -> Vec<&sdf::Path> {
		self.specs.keys().collect()
	}
}
