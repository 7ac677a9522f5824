use crate::{sdf, tf};

/// Value type representing a list-edit operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ListOp<T> {
	pub is_explicit: bool,
	pub explicit_items: Vec<T>,
	pub added_items: Vec<T>,
	pub prepended_items: Vec<T>,
	pub appended_items: Vec<T>,
	pub deleted_items: Vec<T>,
	pub ordered_items: Vec<T>,
}

impl<T> Default for ListOp<T> {
	fn default() -> Self {
		Self {
			is_explicit: false,
			explicit_items: Vec::new(),
			added_items: Vec::new(),
			prepended_items: Vec::new(),
			appended_items: Vec::new(),
			deleted_items: Vec::new(),
			ordered_items: Vec::new(),
		}
	}
}

pub type IntListOp = ListOp<i32>;
pub type UIntListOp = ListOp<u32>;
pub type Int64ListOp = ListOp<i64>;
pub type UInt64ListOp = ListOp<u64>;

pub type TokenListOp = ListOp<tf::Token>;
pub type StringListOp = ListOp<String>;
pub type PathListOp = ListOp<sdf::Path>;
pub type ReferenceListOp = ListOp<sdf::Reference>;
pub type PayloadListOp = ListOp<sdf::Payload>;

impl<T: Clone + PartialEq> ListOp<T> {
	pub fn explicit(items: Vec<T>) -> Self {
		Self {
			is_explicit: true,
			explicit_items: items,
			..Default::default()
		}
	}

	pub fn prepended(items: Vec<T>) -> Self {
		Self {
			prepended_items: items,
			..Default::default()
		}
	}

	pub fn appended(items: Vec<T>) -> Self {
		Self {
			appended_items: items,
			..Default::default()
		}
	}

	pub fn deleted(items: Vec<T>) -> Self {
		Self {
			deleted_items: items,
			..Default::default()
		}
	}

	/// Returns a new op with every item replaced by `f(item)`.
	pub fn map<F: FnMut(&T) -> T>(&self, mut f: F) -> Self {
		let mut apply = |items: &Vec<T>| items.iter().map(&mut f).collect();
		Self {
			is_explicit: self.is_explicit,
			explicit_items: apply(&self.explicit_items),
			added_items: apply(&self.added_items),
			prepended_items: apply(&self.prepended_items),
			appended_items: apply(&self.appended_items),
			deleted_items: apply(&self.deleted_items),
			ordered_items: apply(&self.ordered_items),
		}
	}

	/// Combine this op (the stronger opinion) over `weaker`, yielding a
	/// single op with the same net effect.
	pub fn combined_with(&self, weaker: &ListOp<T>) -> Self {
		if self.is_explicit {
			return self.clone();
		}
		if weaker.is_explicit {
			return Self::explicit(self.apply_operations(weaker.explicit_items.clone()));
		}

		let not_edited_by = |items: &[T], op: &Self| -> Vec<T> {
			items
				.iter()
				.filter(|i| {
					!op.deleted_items.contains(i)
						&& !op.prepended_items.contains(i)
						&& !op.appended_items.contains(i)
				})
				.cloned()
				.collect()
		};

		let mut prepended = self.prepended_items.clone();
		for item in not_edited_by(&weaker.prepended_items, self) {
			if !prepended.contains(&item) {
				prepended.push(item);
			}
		}

		let mut appended = not_edited_by(&weaker.appended_items, self);
		for item in &self.appended_items {
			if !appended.contains(item) {
				appended.push(item.clone());
			}
		}

		let mut added = not_edited_by(&weaker.added_items, self);
		for item in &self.added_items {
			if !added.contains(item) {
				added.push(item.clone());
			}
		}

		let mut deleted = weaker.deleted_items.clone();
		for item in &self.deleted_items {
			if !deleted.contains(item) {
				deleted.push(item.clone());
			}
		}

		let ordered = if !self.ordered_items.is_empty() {
			self.ordered_items.clone()
		} else {
			weaker.ordered_items.clone()
		};

		Self {
			is_explicit: false,
			explicit_items: Vec::new(),
			added_items: added,
			prepended_items: prepended,
			appended_items: appended,
			deleted_items: deleted,
			ordered_items: ordered,
		}
	}

	/// Apply this op's edits over `base`, producing the resulting list.
	pub fn apply_operations(&self, base: Vec<T>) -> Vec<T> {
		if self.is_explicit {
			return self.explicit_items.clone();
		}

		let mut middle: Vec<T> = base
			.into_iter()
			.filter(|i| {
				!self.deleted_items.contains(i)
					&& !self.prepended_items.contains(i)
					&& !self.appended_items.contains(i)
			})
			.collect();

		let mut result = Vec::new();
		for item in &self.prepended_items {
			if !result.contains(item) {
				result.push(item.clone());
			}
		}
		result.append(&mut middle);
		for item in &self.appended_items {
			if !result.contains(item) {
				result.push(item.clone());
			}
		}
		for item in &self.added_items {
			if !result.contains(item) {
				result.push(item.clone());
			}
		}

		self.apply_ordering(result)
	}

	/// The list resulting from applying this op to an empty list.
	pub fn ordered_elements(&self) -> Vec<T> {
		self.apply_operations(Vec::new())
	}

	// Reorder the items named by `ordered_items` to appear in that relative
	// order, anchored at the position of the first of them. Items not named
	// keep their relative order.
	fn apply_ordering(&self, items: Vec<T>) -> Vec<T> {
		if self.ordered_items.is_empty() {
			return items;
		}

		let order_of = |item: &T| self.ordered_items.iter().position(|o| o == item);
		let Some(anchor) = items.iter().position(|i| order_of(i).is_some()) else {
			return items;
		};

		let mut reordered: Vec<T> = self
			.ordered_items
			.iter()
			.filter(|o| items.contains(o))
			.cloned()
			.collect();

		let mut result = Vec::with_capacity(items.len());
		for (i, item) in items.iter().enumerate() {
			if order_of(item).is_some() {
				if i == anchor {
					result.append(&mut reordered);
				}
			} else {
				result.push(item.clone());
			}
		}
		result
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn explicit_wins() {
		let strong = StringListOp::explicit(vec!["a".into(), "b".into()]);
		let weak = StringListOp::appended(vec!["c".into()]);
		assert_eq!(
			strong.combined_with(&weak).ordered_elements(),
			vec!["a".to_string(), "b".to_string()]
		);
	}

	#[test]
	fn prepend_append_delete() {
		let weak = StringListOp::explicit(vec!["a".into(), "b".into(), "c".into()]);
		let strong = StringListOp {
			prepended_items: vec!["p".into()],
			appended_items: vec!["q".into()],
			deleted_items: vec!["b".into()],
			..Default::default()
		};
		assert_eq!(
			strong.combined_with(&weak).ordered_elements(),
			vec![
				"p".to_string(),
				"a".to_string(),
				"c".to_string(),
				"q".to_string()
			]
		);
	}

	#[test]
	fn append_moves_existing() {
		let weak = StringListOp::appended(vec!["a".into(), "b".into()]);
		let strong = StringListOp::appended(vec!["a".into()]);
		assert_eq!(
			strong.combined_with(&weak).ordered_elements(),
			vec!["b".to_string(), "a".to_string()]
		);
	}

	#[test]
	fn ordering_restatement() {
		let op = StringListOp {
			appended_items: vec!["a".into(), "b".into(), "c".into()],
			ordered_items: vec!["c".into(), "a".into()],
			..Default::default()
		};
		assert_eq!(
			op.ordered_elements(),
			vec!["c".to_string(), "a".to_string(), "b".to_string()]
		);
	}
}
