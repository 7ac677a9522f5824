use crate::{sdf, tf, vt};

/// Interface for scene description data storage.
pub trait AbstractData: Send + Sync {
	/// Return the type of the spec at `path`.
	fn spec_type(&self, path: &sdf::Path) -> Option<sdf::SpecType>;

	/// Return the value for the given `path` and `field`.
	fn get(&self, path: &sdf::Path, field: &tf::Token) -> Option<vt::Value>;

	/// Return the names of all the fields that are set at `path`.
	fn list(&self, path: &sdf::Path) -> Vec<&tf::Token>;

	/// Visit every spec in this AbstractData object in arbitrary order.
	fn visit_specs(&self) -> Vec<&sdf::Path>;
}
