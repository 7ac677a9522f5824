use super::cache::AssetResolver;
use super::layer_stack::LayerStack;
use crate::{
	sdf::{self, CHILDREN_KEYS, FIELD_KEYS},
	tf, vt,
};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Provenance for one composed reference or payload arc: the layer whose
/// opinion produced it and that layer's offset within its stack.
#[derive(Debug, Clone)]
pub struct SourceArcInfo {
	pub layer: Arc<sdf::Layer>,
	pub layer_stack_offset: sdf::Retiming,
	pub authored_asset_path: String,
}

/// Shared access to references and payloads, which compose the same way.
pub trait ArcItem: Clone + PartialEq {
	fn asset_path(&self) -> &str;
	fn set_asset_path(&mut self, asset_path: String);
	fn prim_path(&self) -> &sdf::Path;
	fn layer_offset(&self) -> sdf::Retiming;
	fn field_key() -> &'static tf::Token;
	fn list_op(value: &vt::Value) -> Option<sdf::ListOp<Self>>;
}

impl ArcItem for sdf::Reference {
	fn asset_path(&self) -> &str {
		&self.asset_path
	}

	fn set_asset_path(&mut self, asset_path: String) {
		self.asset_path = asset_path;
	}

	fn prim_path(&self) -> &sdf::Path {
		&self.prim_path
	}

	fn layer_offset(&self) -> sdf::Retiming {
		self.layer_offset
	}

	fn field_key() -> &'static tf::Token {
		&FIELD_KEYS.references
	}

	fn list_op(value: &vt::Value) -> Option<sdf::ReferenceListOp> {
		value.get::<sdf::ReferenceListOp>()
	}
}

impl ArcItem for sdf::Payload {
	fn asset_path(&self) -> &str {
		&self.asset_path
	}

	fn set_asset_path(&mut self, asset_path: String) {
		self.asset_path = asset_path;
	}

	fn prim_path(&self) -> &sdf::Path {
		&self.prim_path
	}

	fn layer_offset(&self) -> sdf::Retiming {
		self.layer_offset
	}

	fn field_key() -> &'static tf::Token {
		&FIELD_KEYS.payload
	}

	fn list_op(value: &vt::Value) -> Option<sdf::PayloadListOp> {
		value.get::<sdf::PayloadListOp>()
	}
}

/// Expand `${VAR}` occurrences in `expression` against the layer stack's
/// variable environment. Consulted variable names are recorded for
/// dependency tracking; undefined variables expand to the empty string.
pub fn evaluate_string_expression(
	expression: &str,
	layer_stack: &LayerStack,
	consulted: &mut BTreeSet<String>,
) -> String {
	if !expression.contains("${") {
		return expression.to_string();
	}

	let variables = layer_stack.expression_variables();
	let mut result = String::with_capacity(expression.len());
	let mut rest = expression;
	while let Some(start) = rest.find("${") {
		result.push_str(&rest[..start]);
		let after = &rest[start + 2..];
		match after.find('}') {
			Some(end) => {
				let name = &after[..end];
				consulted.insert(name.to_string());
				if let Some(value) = variables.get(name) {
					result.push_str(value);
				}
				rest = &after[end + 1..];
			}
			None => {
				result.push_str(&rest[start..]);
				rest = "";
			}
		}
	}
	result.push_str(rest);
	result
}

/// Compose the authored reference or payload list at a site. Asset paths
/// are expression-evaluated and anchored to their authoring layer; each
/// returned arc is paired with its provenance.
pub fn compose_site_arc_items<T: ArcItem>(
	layer_stack: &LayerStack,
	path: &sdf::Path,
	resolver: &dyn AssetResolver,
	expression_vars: &mut BTreeSet<String>,
) -> (Vec<T>, Vec<SourceArcInfo>) {
	// Per-layer ops, both as authored and with asset paths anchored, so
	// provenance can be recovered from the combined result.
	let mut layer_ops: Vec<(usize, sdf::ListOp<T>, sdf::ListOp<T>)> = Vec::new();
	for (layer_idx, layer) in layer_stack.layers.iter().enumerate() {
		if let Some(value) = layer.field(path, T::field_key())
			&& let Some(list_op) = T::list_op(&value)
		{
			let mapped = list_op.map(|item: &T| {
				let mut item = item.clone();
				if !item.asset_path().is_empty() {
					let evaluated = evaluate_string_expression(
						item.asset_path(),
						layer_stack,
						expression_vars,
					);
					item.set_asset_path(resolver.resolve(layer, &evaluated));
				}
				item
			});
			layer_ops.push((layer_idx, list_op, mapped));
		}
	}

	let mut combined = sdf::ListOp::<T>::default();
	for (_, _, mapped) in &layer_ops {
		combined = combined.combined_with(mapped);
	}

	let items = combined.ordered_elements();
	let infos = items
		.iter()
		.map(|item| find_arc_source(layer_stack, &layer_ops, item))
		.collect();

	(items, infos)
}

// Find the strongest layer whose authored op mentions `item`.
fn find_arc_source<T: ArcItem>(
	layer_stack: &LayerStack,
	layer_ops: &[(usize, sdf::ListOp<T>, sdf::ListOp<T>)],
	item: &T,
) -> SourceArcInfo {
	for (layer_idx, authored, mapped) in layer_ops {
		let lists = [
			(&mapped.explicit_items, &authored.explicit_items),
			(&mapped.prepended_items, &authored.prepended_items),
			(&mapped.appended_items, &authored.appended_items),
			(&mapped.added_items, &authored.added_items),
		];
		for (mapped_items, authored_items) in lists {
			if let Some(pos) = mapped_items.iter().position(|i| i == item) {
				return SourceArcInfo {
					layer: layer_stack.layers[*layer_idx].clone(),
					layer_stack_offset: layer_stack.layer_offsets[*layer_idx],
					authored_asset_path: authored_items[pos].asset_path().to_string(),
				};
			}
		}
	}

	// Unattributable items keep the stack's root layer as their source.
	SourceArcInfo {
		layer: layer_stack.root_layer().clone(),
		layer_stack_offset: sdf::Retiming::default(),
		authored_asset_path: item.asset_path().to_string(),
	}
}

pub fn compose_site_references(
	layer_stack: &LayerStack,
	path: &sdf::Path,
	resolver: &dyn AssetResolver,
	expression_vars: &mut BTreeSet<String>,
) -> (Vec<sdf::Reference>, Vec<SourceArcInfo>) {
	compose_site_arc_items(layer_stack, path, resolver, expression_vars)
}

pub fn compose_site_payloads(
	layer_stack: &LayerStack,
	path: &sdf::Path,
	resolver: &dyn AssetResolver,
	expression_vars: &mut BTreeSet<String>,
) -> (Vec<sdf::Payload>, Vec<SourceArcInfo>) {
	compose_site_arc_items(layer_stack, path, resolver, expression_vars)
}

fn compose_path_list(
	layer_stack: &LayerStack,
	path: &sdf::Path,
	field: &tf::Token,
) -> Vec<sdf::Path> {
	let mut result = sdf::PathListOp::default();
	for layer in &layer_stack.layers {
		if let Some(value) = layer.field(path, field)
			&& let Some(list_op) = value.get::<sdf::PathListOp>()
		{
			result = result.combined_with(&list_op);
		}
	}
	result.ordered_elements()
}

/// Compose the authored inherit paths at a site.
pub fn compose_site_inherits(layer_stack: &LayerStack, path: &sdf::Path) -> Vec<sdf::Path> {
	compose_path_list(layer_stack, path, &FIELD_KEYS.inherit_paths)
}

/// Compose the authored specialize paths at a site.
pub fn compose_site_specializes(layer_stack: &LayerStack, path: &sdf::Path) -> Vec<sdf::Path> {
	compose_path_list(layer_stack, path, &FIELD_KEYS.specializes)
}

/// Compose the authored variant set names at a site, in authored order.
pub fn compose_site_variant_sets(layer_stack: &LayerStack, path: &sdf::Path) -> Vec<String> {
	let mut result = sdf::StringListOp::default();
	for layer in &layer_stack.layers {
		if let Some(value) = layer.field(path, &FIELD_KEYS.variant_set_names)
			&& let Some(list_op) = value.get::<sdf::StringListOp>()
		{
			result = result.combined_with(&list_op);
		}
	}
	result.ordered_elements()
}

/// Compose the available options of a variant set at a site, by
/// enumerating authored variant specs.
pub fn compose_site_variant_set_options(
	layer_stack: &LayerStack,
	path: &sdf::Path,
	variant_set: &str,
) -> BTreeSet<String> {
	let mut options = BTreeSet::new();
	for layer in &layer_stack.layers {
		for spec_path in layer.data.visit_specs() {
			if spec_path.parent_path() == *path
				&& let Some((set, variant)) = spec_path.variant_selection()
				&& set == variant_set
			{
				options.insert(variant.to_string());
			}
		}
	}
	options
}

/// Compose the authored selection for a variant set at a site. Returns the
/// evaluated selection and the index of the layer that authored it. An
/// authored empty selection counts; it explicitly selects no variant.
pub fn compose_site_variant_selection(
	layer_stack: &LayerStack,
	path: &sdf::Path,
	variant_set: &str,
	expression_vars: &mut BTreeSet<String>,
) -> Option<(String, usize)> {
	for (layer_idx, layer) in layer_stack.layers.iter().enumerate() {
		if let Some(value) = layer.field(path, &FIELD_KEYS.variant_selection)
			&& let Some(selections) = value.get::<sdf::VariantSelectionMap>()
			&& let Some(selection) = selections.get(variant_set)
		{
			let evaluated =
				evaluate_string_expression(selection, layer_stack, expression_vars);
			return Some((evaluated, layer_idx));
		}
	}
	None
}

/// Returns whether any layer in the stack has a prim spec at `path`.
pub fn compose_site_has_prim_specs(layer_stack: &LayerStack, path: &sdf::Path) -> bool {
	layer_stack.layers.iter().any(|layer| layer.has_spec(path))
}

/// Compose the permission authored at a site; the strongest opinion wins.
pub fn compose_site_permission(layer_stack: &LayerStack, path: &sdf::Path) -> sdf::Permission {
	for layer in &layer_stack.layers {
		if let Some(value) = layer.field(path, &FIELD_KEYS.permission)
			&& let Some(permission) = value.get::<sdf::Permission>()
		{
			return permission;
		}
	}
	sdf::Permission::Public
}

/// Returns whether any layer authors symmetry at `path`.
pub fn compose_site_has_symmetry(layer_stack: &LayerStack, path: &sdf::Path) -> bool {
	layer_stack
		.layers
		.iter()
		.any(|layer| layer.has_field(path, &FIELD_KEYS.symmetry_function))
}

/// Every `(layer, path)` in the stack carrying a prim spec, strongest
/// first.
pub fn compose_site_prim_sites(
	layer_stack: &LayerStack,
	path: &sdf::Path,
) -> Vec<(Arc<sdf::Layer>, sdf::Path)> {
	layer_stack
		.layers
		.iter()
		.filter(|layer| layer.has_spec(path))
		.map(|layer| (layer.clone(), path.clone()))
		.collect()
}

/// Compose the child prim names at a site over `name_order`/`name_set`,
/// honoring `primOrder` restatements.
pub fn compose_site_child_names(
	layer_stack: &LayerStack,
	path: &sdf::Path,
	name_order: &mut Vec<tf::Token>,
	name_set: &mut BTreeSet<tf::Token>,
) {
	for layer in &layer_stack.layers {
		if let Some(value) = layer.field(path, &CHILDREN_KEYS.prim_children)
			&& let Some(children) = value.get::<Vec<tf::Token>>()
		{
			for child in children {
				if name_set.insert(child.clone()) {
					name_order.push(child);
				}
			}
		}
	}

	// Apply the strongest authored ordering restatement.
	for layer in &layer_stack.layers {
		if let Some(value) = layer.field(path, &FIELD_KEYS.prim_order)
			&& let Some(order) = value.get::<Vec<tf::Token>>()
		{
			let reorder = sdf::TokenListOp {
				ordered_items: order,
				..Default::default()
			};
			*name_order = reorder.apply_operations(std::mem::take(name_order));
			break;
		}
	}
}
