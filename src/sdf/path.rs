use crate::tf;
use std::sync::Arc;

/// One component of a prim path. Variant selections are stored as their own
/// components; they address storage in a layer, not composed namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(super) enum PathPart {
	Prim(tf::Token),
	VariantSelection {
		variant_set: tf::Token,
		variant: tf::Token,
	},
}

/// A path value used to locate objects in layers or scenegraphs.
///
/// All non-empty paths are absolute. A path is an immutable, shared list of
/// components and compares structurally.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Path {
	parts: Option<Arc<Vec<PathPart>>>,
}

impl Path {
	/// The empty path value.
	pub fn empty_path() -> Self {
		Self { parts: None }
	}

	/// The absolute path representing the top of the namespace hierarchy.
	pub fn absolute_root_path() -> Self {
		Self {
			parts: Some(Arc::new(Vec::new())),
		}
	}

	fn from_parts(parts: Vec<PathPart>) -> Self {
		Self {
			parts: Some(Arc::new(parts)),
		}
	}

	fn parts(&self) -> &[PathPart] {
		match &self.parts {
			Some(parts) => parts,
			None => &[],
		}
	}
}

/// Querying paths.
impl Path {
	/// Returns true if this path is the [`Self::empty_path`].
	pub fn is_empty(&self) -> bool {
		self.parts.is_none()
	}

	/// Returns true if this path is the [`Self::absolute_root_path`].
	pub fn is_absolute_root(&self) -> bool {
		matches!(&self.parts, Some(parts) if parts.is_empty())
	}

	/// Returns whether the path identifies a prim.
	pub fn is_prim_path(&self) -> bool {
		matches!(self.parts().last(), Some(PathPart::Prim(_)))
	}

	/// Returns whether the path identifies a prim or the absolute root.
	pub fn is_absolute_root_or_prim_path(&self) -> bool {
		self.is_absolute_root() || self.is_prim_path()
	}

	/// Returns whether the path identifies a root prim, i.e. a prim that is
	/// an immediate child of the absolute root.
	pub fn is_root_prim_path(&self) -> bool {
		self.parts().len() == 1 && self.is_prim_path()
	}

	/// Returns whether the path identifies a variant selection of a prim.
	pub fn is_prim_variant_selection_path(&self) -> bool {
		matches!(self.parts().last(), Some(PathPart::VariantSelection { .. }))
	}

	/// Returns whether the path carries a variant selection component
	/// anywhere along it.
	pub fn contains_prim_variant_selection(&self) -> bool {
		self.parts()
			.iter()
			.any(|p| matches!(p, PathPart::VariantSelection { .. }))
	}

	/// Returns the variant selection `(set, variant)` if the path ends in a
	/// variant selection component.
	pub fn variant_selection(&self) -> Option<(&str, &str)> {
		match self.parts().last() {
			Some(PathPart::VariantSelection {
				variant_set,
				variant,
			}) => Some((variant_set.as_str(), variant.as_str())),
			_ => None,
		}
	}

	/// Return the path that identifies this path's namespace parent.
	pub fn parent_path(&self) -> Self {
		match &self.parts {
			None => Self::empty_path(),
			Some(parts) if parts.is_empty() => Self::empty_path(),
			Some(parts) => Self::from_parts(parts[..parts.len() - 1].to_vec()),
		}
	}

	/// Returns the name of the prim identified by the path, or the textual
	/// form of its variant selection.
	pub fn name(&self) -> String {
		match self.parts().last() {
			Some(PathPart::Prim(name)) => name.to_string(),
			Some(PathPart::VariantSelection {
				variant_set,
				variant,
			}) => format!("{{{variant_set}={variant}}}"),
			None => String::new(),
		}
	}

	/// Returns the name of the prim identified by the path as a token.
	pub fn name_token(&self) -> tf::Token {
		match self.parts().last() {
			Some(PathPart::Prim(name)) => name.clone(),
			_ => tf::Token::default(),
		}
	}

	/// Returns the number of path components.
	pub fn element_count(&self) -> usize {
		self.parts().len()
	}

	/// Returns the number of path components, not counting variant
	/// selections.
	pub fn non_variant_element_count(&self) -> usize {
		self.parts()
			.iter()
			.filter(|p| matches!(p, PathPart::Prim(_)))
			.count()
	}

	/// Returns whether `prefix` is a component-wise prefix of this path.
	/// The empty path is a prefix of nothing.
	pub fn has_prefix(&self, prefix: &Path) -> bool {
		match (&self.parts, &prefix.parts) {
			(Some(parts), Some(prefix_parts)) => {
				parts.len() >= prefix_parts.len()
					&& parts[..prefix_parts.len()] == prefix_parts[..]
			}
			_ => false,
		}
	}

	/// Return a range for iterating over the ancestors of this path.
	///
	/// The range provides iteration over the prefixes of a path, ordered from
	/// longest to shortest. Starting with the path itself and ending with a
	/// single element path, not including the empty/root path.
	pub fn ancestors_range(&self) -> PathAncestorsRange {
		PathAncestorsRange { path: self.clone() }
	}
}

/// Creating new paths by modifying existing paths.
impl Path {
	/// Creates a path by appending an element for `child_name` to this path.
	pub fn append_child(&self, child_name: &tf::Token) -> Self {
		if self.is_empty() {
			return Self::empty_path();
		}

		let mut parts = self.parts().to_vec();
		parts.push(PathPart::Prim(child_name.clone()));
		Self::from_parts(parts)
	}

	/// Creates a path by appending an element for `variant_set` and
	/// `variant` to this path. This path must be a prim path.
	pub fn append_variant_selection(&self, variant_set: &str, variant: &str) -> Self {
		if self.is_empty() || self.is_absolute_root() {
			return Self::empty_path();
		}

		let mut parts = self.parts().to_vec();
		parts.push(PathPart::VariantSelection {
			variant_set: tf::Token::new(variant_set),
			variant: tf::Token::new(variant),
		});
		Self::from_parts(parts)
	}

	/// Returns a path with `old_prefix` replaced by `new_prefix`. Paths not
	/// prefixed by `old_prefix` are returned unchanged.
	pub fn replace_prefix(&self, old_prefix: &Path, new_prefix: &Path) -> Self {
		if !self.has_prefix(old_prefix) || new_prefix.is_empty() {
			return self.clone();
		}

		let mut parts = new_prefix.parts().to_vec();
		parts.extend_from_slice(&self.parts()[old_prefix.element_count()..]);
		Self::from_parts(parts)
	}

	/// Returns the path with every variant selection component removed.
	pub fn strip_all_variant_selections(&self) -> Self {
		if self.is_empty() {
			return Self::empty_path();
		}

		Self::from_parts(
			self.parts()
				.iter()
				.filter(|p| matches!(p, PathPart::Prim(_)))
				.cloned()
				.collect(),
		)
	}

	/// Returns the path with trailing variant selection components removed,
	/// yielding the prim this path addresses storage for.
	pub fn prim_path(&self) -> Self {
		let parts = self.parts();
		let mut len = parts.len();
		while len > 0 && matches!(parts[len - 1], PathPart::VariantSelection { .. }) {
			len -= 1;
		}
		if len == parts.len() {
			self.clone()
		} else {
			Self::from_parts(parts[..len].to_vec())
		}
	}
}

impl From<&str> for Path {
	fn from(s: &str) -> Self {
		parse_path(s).unwrap_or_else(|_| Self::empty_path())
	}
}

impl std::fmt::Display for Path {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		let Some(parts) = &self.parts else {
			return Ok(());
		};

		if parts.is_empty() {
			return write!(f, "/");
		}

		let mut previous_was_selection = false;
		for part in parts.iter() {
			match part {
				PathPart::Prim(name) => {
					if previous_was_selection {
						write!(f, "{name}")?;
					} else {
						write!(f, "/{name}")?;
					}
					previous_was_selection = false;
				}
				PathPart::VariantSelection {
					variant_set,
					variant,
				} => {
					write!(f, "{{{variant_set}={variant}}}")?;
					previous_was_selection = true;
				}
			}
		}
		Ok(())
	}
}

impl std::fmt::Debug for Path {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "<{self}>")
	}
}

pub struct PathAncestorsRange {
	path: Path,
}

impl std::iter::Iterator for PathAncestorsRange {
	type Item = Path;

	fn next(&mut self) -> Option<Self::Item> {
		if self.path.is_empty() || self.path.is_absolute_root() {
			return None;
		}

		let current_path = self.path.clone();
		self.path = if self.path.element_count() > 1 {
			self.path.parent_path()
		} else {
			Path::empty_path()
		};

		Some(current_path)
	}
}

fn is_identifier_char(c: char) -> bool {
	c.is_ascii_alphanumeric() || c == '_'
}

/// Parse an absolute prim path, optionally carrying variant selections,
/// e.g. `/Model/Rig{lod=high}Arm`.
fn parse_path(s: &str) -> Result<Path, String> {
	if s.is_empty() {
		return Ok(Path::empty_path());
	}
	if s == "/" {
		return Ok(Path::absolute_root_path());
	}

	let mut chars = s.chars().peekable();
	if chars.peek() != Some(&'/') {
		return Err(format!("path '{s}' is not absolute"));
	}

	let mut parts = Vec::new();
	while let Some(&c) = chars.peek() {
		match c {
			'/' => {
				chars.next();
				let mut name = String::new();
				while let Some(&c) = chars.peek()
					&& is_identifier_char(c)
				{
					name.push(c);
					chars.next();
				}
				if name.is_empty() {
					return Err(format!("empty prim name in path '{s}'"));
				}
				parts.push(PathPart::Prim(tf::Token::new(name)));
			}
			'{' => {
				chars.next();
				let mut selection = String::new();
				let mut closed = false;
				for c in chars.by_ref() {
					if c == '}' {
						closed = true;
						break;
					}
					selection.push(c);
				}
				if !closed {
					return Err(format!("unterminated variant selection in path '{s}'"));
				}
				let Some((variant_set, variant)) = selection.split_once('=') else {
					return Err(format!("malformed variant selection in path '{s}'"));
				};
				if parts.is_empty() {
					return Err(format!("variant selection without prim in path '{s}'"));
				}
				parts.push(PathPart::VariantSelection {
					variant_set: tf::Token::new(variant_set.trim()),
					variant: tf::Token::new(variant.trim()),
				});
			}
			c if is_identifier_char(c) => {
				// A prim name directly after a closing variant brace.
				if !matches!(parts.last(), Some(PathPart::VariantSelection { .. })) {
					return Err(format!("unexpected character '{c}' in path '{s}'"));
				}
				let mut name = String::new();
				while let Some(&c) = chars.peek()
					&& is_identifier_char(c)
				{
					name.push(c);
					chars.next();
				}
				parts.push(PathPart::Prim(tf::Token::new(name)));
			}
			c => return Err(format!("unexpected character '{c}' in path '{s}'")),
		}
	}

	Ok(Path::from_parts(parts))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn p(s: &str) -> Path {
		Path::from(s)
	}

	fn t(s: &str) -> tf::Token {
		tf::Token::new(s)
	}

	#[test]
	fn append_child() {
		assert_eq!(p("/foo").append_child(&t("bar")), p("/foo/bar"));
		assert_eq!(Path::absolute_root_path().append_child(&t("foo")), p("/foo"));
		assert_eq!(
			Path::empty_path().append_child(&t("bar")),
			Path::empty_path()
		);
	}

	#[test]
	fn parent_path() {
		assert_eq!(p("/foo").parent_path(), Path::absolute_root_path());
		assert_eq!(p("/foo/bar").parent_path(), p("/foo"));
		assert_eq!(p("/foo{v=a}").parent_path(), p("/foo"));
		assert_eq!(p("/foo{v=a}bar").parent_path(), p("/foo{v=a}"));
		assert_eq!(Path::absolute_root_path().parent_path(), Path::empty_path());
	}

	#[test]
	fn prefixes() {
		assert!(p("/foo/bar").has_prefix(&p("/foo")));
		assert!(p("/foo/bar").has_prefix(&p("/foo/bar")));
		assert!(!p("/foo").has_prefix(&p("/foo/bar")));
		assert!(!p("/foobar").has_prefix(&p("/foo")));
		assert!(p("/foo").has_prefix(&Path::absolute_root_path()));
		assert!(!p("/foo").has_prefix(&Path::empty_path()));

		assert_eq!(
			p("/foo/bar").replace_prefix(&p("/foo"), &p("/baz")),
			p("/baz/bar")
		);
		assert_eq!(
			p("/other").replace_prefix(&p("/foo"), &p("/baz")),
			p("/other")
		);
	}

	#[test]
	fn variant_selections() {
		let path = p("/Model{lod=high}Arm");
		assert!(path.contains_prim_variant_selection());
		assert!(!path.is_prim_variant_selection_path());
		assert_eq!(path.strip_all_variant_selections(), p("/Model/Arm"));

		let sel = p("/Model{lod=high}");
		assert!(sel.is_prim_variant_selection_path());
		assert_eq!(sel.variant_selection(), Some(("lod", "high")));
		assert_eq!(sel.prim_path(), p("/Model"));
		assert_eq!(p("/Model").append_variant_selection("lod", "high"), sel);
	}

	#[test]
	fn element_counts() {
		assert_eq!(p("/foo/bar").element_count(), 2);
		assert_eq!(p("/foo{v=a}bar").element_count(), 3);
		assert_eq!(p("/foo{v=a}bar").non_variant_element_count(), 2);
		assert_eq!(Path::absolute_root_path().element_count(), 0);
	}

	#[test]
	fn ancestors_range() {
		let path = p("/foo/bar/baz");
		let mut ancestors = path.ancestors_range();
		assert_eq!(ancestors.next(), Some(p("/foo/bar/baz")));
		assert_eq!(ancestors.next(), Some(p("/foo/bar")));
		assert_eq!(ancestors.next(), Some(p("/foo")));
		assert_eq!(ancestors.next(), None);
	}

	#[test]
	fn print() {
		assert_eq!(p("/foo").to_string(), "/foo");
		assert_eq!(p("/foo/bar").to_string(), "/foo/bar");
		assert_eq!(p("/foo{v=a}bar").to_string(), "/foo{v=a}bar");
		assert_eq!(Path::absolute_root_path().to_string(), "/");
		assert_eq!(Path::empty_path().to_string(), "");
	}
}
