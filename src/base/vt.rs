use crate::{sdf, tf};
use std::collections::BTreeMap;

/// A dictionary of named values.
pub type Dictionary = BTreeMap<String, Value>;

/// A container for one of the value types storable in scene description
/// fields consumed by the composition core.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
	Bool(bool),
	Double(f64),
	Token(tf::Token),
	String(String),
	StringVec(Vec<String>),
	TokenVec(Vec<tf::Token>),
	StringMap(BTreeMap<String, String>),
	StringListOp(sdf::StringListOp),
	PathListOp(sdf::PathListOp),
	ReferenceListOp(sdf::ReferenceListOp),
	PayloadListOp(sdf::PayloadListOp),
	Relocates(Vec<sdf::Relocate>),
	Permission(sdf::Permission),
	Retiming(sdf::Retiming),
	RetimingVec(Vec<sdf::Retiming>),
}

impl Value {
	/// Return the held value as a `T`, or `None` if a different type is held.
	pub fn get<T: FromValue>(&self) -> Option<T> {
		T::from_value(self)
	}
}

/// Extraction of a typed value out of a [`Value`].
pub trait FromValue: Sized {
	fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! impl_from_value {
	($type:ty, $variant:ident) => {
		impl FromValue for $type {
			fn from_value(value: &Value) -> Option<Self> {
				match value {
					Value::$variant(v) => Some(v.clone()),
					_ => None,
				}
			}
		}
	};
}

impl_from_value!(bool, Bool);
impl_from_value!(f64, Double);
impl_from_value!(tf::Token, Token);
impl_from_value!(String, String);
impl_from_value!(Vec<String>, StringVec);
impl_from_value!(Vec<tf::Token>, TokenVec);
impl_from_value!(BTreeMap<String, String>, StringMap);
impl_from_value!(sdf::StringListOp, StringListOp);
impl_from_value!(sdf::PathListOp, PathListOp);
impl_from_value!(sdf::ReferenceListOp, ReferenceListOp);
impl_from_value!(sdf::PayloadListOp, PayloadListOp);
impl_from_value!(Vec<sdf::Relocate>, Relocates);
impl_from_value!(sdf::Permission, Permission);
impl_from_value!(sdf::Retiming, Retiming);
impl_from_value!(Vec<sdf::Retiming>, RetimingVec);
