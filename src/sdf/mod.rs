//! Scene Description Foundations

mod abstract_data;
mod data;
mod layer;
mod list_op;
mod path;
mod retiming;
mod schema;

pub use abstract_data::*;
pub use data::*;
pub use layer::*;
pub use list_op::*;
pub use path::*;
pub use retiming::*;
pub use schema::{CHILDREN_KEYS, FIELD_KEYS};

use crate::vt;
use std::collections::BTreeMap;

/// An enum that specifies the type of an object.
/// Objects have fields and are adressable by path.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub enum SpecType {
	#[default]
	Unknown,
	Prim,
	PseudoRoot,
	Variant,
	VariantSet,
}

/// An enum that defines permission levels.
///
/// A private object can only be accessed within the layer stack where it is
/// defined; composition arcs from other sites may not target it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
	#[default]
	Public,
	Private,
}

/// Represents a reference and all its meta data.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Reference {
	/// The asset path to the external layer.
	pub asset_path: String,
	/// The path to the referenced prim in the external layer.
	pub prim_path: Path,
	/// The layer offset to transform time.
	pub layer_offset: Retiming,
	/// The custom data associated with the reference.
	pub custom_data: vt::Dictionary,
}

/// Represents a payload and all its meta data.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Payload {
	/// The asset path to the external layer.
	pub asset_path: String,
	/// The root prim path to the referenced prim in the external layer.
	pub prim_path: Path,
	/// The layer offset to transform time.
	pub layer_offset: Retiming,
}

/// A single relocate specifying a source and target path for a relocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Relocate {
	pub source: Path,
	pub target: Path,
}

/// A map of variant-set name to selected variant.
pub type VariantSelectionMap = BTreeMap<String, String>;
