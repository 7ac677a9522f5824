use crate::{
	sdf::{self, FIELD_KEYS},
	tf, vt,
};

/// A scene description container that can combine with other such containers
/// to form simple component assets, and successively larger aggregates.
/// The contents of a Layer adhere to the [sdf::AbstractData] data model.
pub struct Layer {
	identifier: String,
	pub(crate) data: Box<dyn sdf::AbstractData>,
}

impl std::fmt::Debug for Layer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Layer")
			.field("identifier", &self.identifier)
			.finish()
	}
}

impl Layer {
	pub fn new(identifier: impl ToString, data: Box<dyn sdf::AbstractData>) -> Self {
		Self {
			identifier: identifier.to_string(),
			data,
		}
	}

	pub fn identifier(&self) -> &str {
		&self.identifier
	}

	pub fn has_spec(&self, path: &sdf::Path) -> bool {
		self.data.spec_type(path).is_some()
	}

	pub fn field(&self, path: &sdf::Path, field: &tf::Token) -> Option<vt::Value> {
		self.data.get(path, field)
	}

	pub fn has_field(&self, path: &sdf::Path, field: &tf::Token) -> bool {
		self.data.get(path, field).is_some()
	}
}

/// Metadata
impl Layer {
	/// Return this layer's 'defaultPrim' metadata.
	pub fn default_prim(&self) -> tf::Token {
		self.data
			.get(&sdf::Path::absolute_root_path(), &FIELD_KEYS.default_prim)
			.and_then(|v| v.get::<tf::Token>())
			.unwrap_or_default()
	}

	/// Return this layer's 'defaultPrim' metadata interpreted as an absolute prim path.
	pub fn default_prim_as_path(&self) -> sdf::Path {
		let default_prim_token = self.default_prim();
		if default_prim_token.is_empty() {
			return sdf::Path::empty_path();
		}

		if default_prim_token.as_str().starts_with('/') {
			sdf::Path::from(default_prim_token.as_str())
		} else {
			sdf::Path::absolute_root_path().append_child(&default_prim_token)
		}
	}

	/// Return this layer's 'timeCodesPerSecond' metadata.
	pub fn timecodes_per_second(&self) -> f64 {
		self.data
			.get(
				&sdf::Path::absolute_root_path(),
				&FIELD_KEYS.timecodes_per_second,
			)
			.and_then(|v| v.get::<f64>())
			.unwrap_or(24.0)
	}

	/// Return the expression variables authored on this layer.
	pub fn expression_variables(&self) -> std::collections::BTreeMap<String, String> {
		self.data
			.get(
				&sdf::Path::absolute_root_path(),
				&FIELD_KEYS.expression_variables,
			)
			.and_then(|v| v.get::<std::collections::BTreeMap<String, String>>())
			.unwrap_or_default()
	}
}

/// Sublayers
impl Layer {
	pub fn sub_layer_paths(&self) -> Vec<String> {
		self.data
			.get(&sdf::Path::absolute_root_path(), &FIELD_KEYS.sub_layers)
			.and_then(|v| v.get::<Vec<String>>())
			.unwrap_or_default()
	}

	pub fn sub_layer_offsets(&self) -> Vec<sdf::Retiming> {
		self.data
			.get(
				&sdf::Path::absolute_root_path(),
				&FIELD_KEYS.sub_layer_offsets,
			)
			.and_then(|v| v.get::<Vec<sdf::Retiming>>())
			.unwrap_or_default()
	}
}

/// Relocates
impl Layer {
	pub fn relocates(&self) -> Vec<sdf::Relocate> {
		self.data
			.get(
				&sdf::Path::absolute_root_path(),
				&FIELD_KEYS.layer_relocates,
			)
			.and_then(|v| v.get::<Vec<sdf::Relocate>>())
			.unwrap_or_default()
	}
}
