use crate::sdf;
use std::sync::{Arc, OnceLock};

/// A function that maps paths from one namespace to another.
///
/// A map function is a finite set of `(source, target)` path pairs plus a
/// time retiming. A path translates by its longest matching source prefix;
/// paths outside every source translate to the empty path. The identity
/// entry `/ -> /` (the root identity) makes every path translate.
#[derive(Debug, Clone, PartialEq)]
pub struct MapFunction {
	/// Pairs sorted by source path, canonicalized so that no entry is
	/// implied by a shorter one.
	pairs: Vec<(sdf::Path, sdf::Path)>,
	pub time_offset: sdf::Retiming,
}

impl MapFunction {
	pub fn new(pairs: Vec<(sdf::Path, sdf::Path)>, time_offset: sdf::Retiming) -> Self {
		let mut function = Self { pairs, time_offset };
		function.canonicalize();
		function
	}

	/// The identity function, `/ -> /` with no retiming.
	pub fn identity() -> Self {
		Self {
			pairs: vec![(
				sdf::Path::absolute_root_path(),
				sdf::Path::absolute_root_path(),
			)],
			time_offset: sdf::Retiming::default(),
		}
	}

	pub fn is_identity(&self) -> bool {
		self.has_root_identity()
			&& self.pairs.len() == 1
			&& self.time_offset == sdf::Retiming::default()
	}

	pub fn has_root_identity(&self) -> bool {
		self.pairs
			.iter()
			.any(|(s, t)| s.is_absolute_root() && t.is_absolute_root())
	}

	pub fn pairs(&self) -> &[(sdf::Path, sdf::Path)] {
		&self.pairs
	}

	/// Map `path` from the source namespace to the target namespace.
	/// Returns the empty path if the path does not translate.
	pub fn map_source_to_target(&self, path: &sdf::Path) -> sdf::Path {
		Self::map_path(&self.pairs, path, |pair| (&pair.0, &pair.1))
	}

	/// Map `path` from the target namespace to the source namespace.
	/// Returns the empty path if the path does not translate.
	pub fn map_target_to_source(&self, path: &sdf::Path) -> sdf::Path {
		Self::map_path(&self.pairs, path, |pair| (&pair.1, &pair.0))
	}

	fn map_path<'a>(
		pairs: &'a [(sdf::Path, sdf::Path)],
		path: &sdf::Path,
		project: impl Fn(&'a (sdf::Path, sdf::Path)) -> (&'a sdf::Path, &'a sdf::Path),
	) -> sdf::Path {
		if path.is_empty() {
			return sdf::Path::empty_path();
		}

		let mut best: Option<(&sdf::Path, &sdf::Path)> = None;
		for pair in pairs {
			let (from, to) = project(pair);
			if path.has_prefix(from)
				&& best.is_none_or(|(b, _)| from.element_count() > b.element_count())
			{
				best = Some((from, to));
			}
		}

		match best {
			Some((from, to)) => path.replace_prefix(from, to),
			None => sdf::Path::empty_path(),
		}
	}

	/// The composition `self o inner`: first map through `inner`, then
	/// through `self`.
	pub fn compose(&self, inner: &MapFunction) -> MapFunction {
		let mut pairs = Vec::new();
		for (source, target) in &inner.pairs {
			let mapped = self.map_source_to_target(target);
			if !mapped.is_empty() {
				pairs.push((source.clone(), mapped));
			}
		}
		for (source, target) in &self.pairs {
			let pulled = inner.map_target_to_source(source);
			if !pulled.is_empty() && !pairs.iter().any(|(s, _)| *s == pulled) {
				pairs.push((pulled, target.clone()));
			}
		}

		MapFunction::new(pairs, self.time_offset * inner.time_offset)
	}

	/// The inverse function, with source and target swapped.
	pub fn inverse(&self) -> MapFunction {
		MapFunction::new(
			self.pairs.iter().map(|(s, t)| (t.clone(), s.clone())).collect(),
			self.time_offset.inv(),
		)
	}

	/// Returns this function with a `/ -> /` entry added. Idempotent.
	pub fn add_root_identity(&self) -> MapFunction {
		if self.has_root_identity() {
			return self.clone();
		}

		let mut pairs = self.pairs.clone();
		pairs.push((
			sdf::Path::absolute_root_path(),
			sdf::Path::absolute_root_path(),
		));
		MapFunction::new(pairs, self.time_offset)
	}

	// Sort by source and drop entries already implied by a shorter prefix
	// entry, so that structural equality detects equivalent functions.
	fn canonicalize(&mut self) {
		self.pairs.retain(|(s, t)| !s.is_empty() && !t.is_empty());
		self.pairs.sort();
		self.pairs.dedup_by(|a, b| a.0 == b.0);

		let pairs = self.pairs.clone();
		self.pairs.retain(|(source, target)| {
			let others: Vec<_> = pairs
				.iter()
				.filter(|(s, _)| s != source)
				.cloned()
				.collect();
			Self::map_path(&others, source, |pair| (&pair.0, &pair.1)) != *target
		});
	}
}

#[derive(Debug)]
enum ExpressionOp {
	Identity,
	Constant(MapFunction),
	Compose(MapExpression, MapExpression),
	Inverse(MapExpression),
	AddRootIdentity(MapExpression),
}

#[derive(Debug)]
struct ExpressionNode {
	op: ExpressionOp,
	cached: OnceLock<MapFunction>,
}

/// A lazy expression tree over map functions, evaluated on demand.
/// Evaluation results are memoized per expression node.
#[derive(Debug, Clone)]
pub struct MapExpression {
	node: Arc<ExpressionNode>,
}

impl MapExpression {
	fn wrap(op: ExpressionOp) -> Self {
		Self {
			node: Arc::new(ExpressionNode {
				op,
				cached: OnceLock::new(),
			}),
		}
	}

	pub fn identity() -> Self {
		Self::wrap(ExpressionOp::Identity)
	}

	pub fn constant(function: MapFunction) -> Self {
		Self::wrap(ExpressionOp::Constant(function))
	}

	/// The composition `self o inner`.
	pub fn compose(&self, inner: &MapExpression) -> Self {
		if self.is_constant_identity() {
			return inner.clone();
		}
		if inner.is_constant_identity() {
			return self.clone();
		}
		Self::wrap(ExpressionOp::Compose(self.clone(), inner.clone()))
	}

	pub fn inverse(&self) -> Self {
		if self.is_constant_identity() {
			return self.clone();
		}
		Self::wrap(ExpressionOp::Inverse(self.clone()))
	}

	pub fn add_root_identity(&self) -> Self {
		if self.is_constant_identity() {
			return self.clone();
		}
		Self::wrap(ExpressionOp::AddRootIdentity(self.clone()))
	}

	/// Returns whether this expression is the constant identity.
	pub fn is_constant_identity(&self) -> bool {
		match &self.node.op {
			ExpressionOp::Identity => true,
			ExpressionOp::Constant(f) => f.is_identity(),
			_ => false,
		}
	}

	/// Evaluate the expression to a concrete map function.
	pub fn evaluate(&self) -> &MapFunction {
		self.node.cached.get_or_init(|| match &self.node.op {
			ExpressionOp::Identity => MapFunction::identity(),
			ExpressionOp::Constant(f) => f.clone(),
			ExpressionOp::Compose(outer, inner) => outer.evaluate().compose(inner.evaluate()),
			ExpressionOp::Inverse(inner) => inner.evaluate().inverse(),
			ExpressionOp::AddRootIdentity(inner) => inner.evaluate().add_root_identity(),
		})
	}

	pub fn map_source_to_target(&self, path: &sdf::Path) -> sdf::Path {
		self.evaluate().map_source_to_target(path)
	}

	pub fn map_target_to_source(&self, path: &sdf::Path) -> sdf::Path {
		self.evaluate().map_target_to_source(path)
	}

	pub fn time_offset(&self) -> sdf::Retiming {
		self.evaluate().time_offset
	}
}

impl PartialEq for MapExpression {
	fn eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.node, &other.node) || self.evaluate() == other.evaluate()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn p(s: &str) -> sdf::Path {
		sdf::Path::from(s)
	}

	fn map(source: &str, target: &str) -> MapFunction {
		MapFunction::new(vec![(p(source), p(target))], sdf::Retiming::default())
	}

	#[test]
	fn longest_prefix_wins() {
		let f = MapFunction::new(
			vec![(p("/A"), p("/X")), (p("/A/B"), p("/Y"))],
			sdf::Retiming::default(),
		);
		assert_eq!(f.map_source_to_target(&p("/A/C")), p("/X/C"));
		assert_eq!(f.map_source_to_target(&p("/A/B/C")), p("/Y/C"));
		assert_eq!(f.map_source_to_target(&p("/Other")), sdf::Path::empty_path());
	}

	#[test]
	fn root_identity_catches_all() {
		let f = map("/A", "/X").add_root_identity();
		assert_eq!(f.map_source_to_target(&p("/A/B")), p("/X/B"));
		assert_eq!(f.map_source_to_target(&p("/Other")), p("/Other"));
		assert!(f.add_root_identity() == f);
	}

	#[test]
	fn compose_maps_through_both() {
		let f = map("/X", "/Final");
		let g = map("/A", "/X");
		let composed = f.compose(&g);
		assert_eq!(composed.map_source_to_target(&p("/A/B")), p("/Final/B"));
	}

	#[test]
	fn inverse_swaps() {
		let f = map("/Class", "/Model");
		let inv = f.inverse();
		assert_eq!(inv.map_source_to_target(&p("/Model/Rig")), p("/Class/Rig"));
		assert_eq!(f.map_target_to_source(&p("/Model/Rig")), p("/Class/Rig"));
	}

	#[test]
	fn canonicalization_drops_implied_entries() {
		let f = MapFunction::new(
			vec![(p("/A"), p("/X")), (p("/A/B"), p("/X/B"))],
			sdf::Retiming::default(),
		);
		assert_eq!(f.pairs().len(), 1);
		assert_eq!(f, map("/A", "/X"));
	}

	#[test]
	fn expression_memoizes() {
		let expr = MapExpression::constant(map("/A", "/X"))
			.compose(&MapExpression::constant(map("/B", "/A")));
		let first = expr.evaluate() as *const MapFunction;
		let second = expr.evaluate() as *const MapFunction;
		assert_eq!(first, second);
		assert_eq!(expr.map_source_to_target(&p("/B/C")), p("/X/C"));
	}

	#[test]
	fn identity_shortcuts() {
		let f = MapExpression::constant(map("/A", "/X"));
		assert!(MapExpression::identity().compose(&f) == f);
		assert!(f.compose(&MapExpression::identity()) == f);
		assert!(MapExpression::identity().is_constant_identity());
	}
}
