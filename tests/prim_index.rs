mod common;

use common::*;
use opencomp_rs::{pcp, sdf};
use std::sync::Arc;

fn s(layer: &str, path: &str) -> (String, String) {
	(layer.to_string(), path.to_string())
}

#[test]
fn single_reference() {
	let scene = Scene::new();
	scene.add_layer(LayerBuilder::new("asset.usda").prim("/M").prim("/M/X").build());
	scene.add_layer(
		LayerBuilder::new("root.usda")
			.prim("/Model")
			.references("/Model", vec![reference("asset.usda", "/M")])
			.build(),
	);

	let outputs = scene.compute("root.usda", "/Model");

	assert!(outputs.all_errors.is_empty(), "{:?}", outputs.all_errors);
	assert_eq!(
		site_strings(&outputs.prim_index),
		vec![s("root.usda", "/Model"), s("asset.usda", "/M")]
	);
	assert_eq!(child_names(&outputs.prim_index), vec!["X".to_string()]);
}

#[test]
fn reference_with_implied_inherit() {
	let scene = Scene::new();
	scene.add_layer(
		LayerBuilder::new("asset.usda")
			.prim("/M")
			.prim("/C")
			.inherits("/M", &["/C"])
			.build(),
	);
	scene.add_layer(
		LayerBuilder::new("root.usda")
			.prim("/Model")
			.references("/Model", vec![reference("asset.usda", "/M")])
			.build(),
	);

	let outputs = scene.compute("root.usda", "/Model");

	assert!(outputs.all_errors.is_empty(), "{:?}", outputs.all_errors);
	assert_eq!(
		site_strings(&outputs.prim_index),
		vec![
			s("root.usda", "/Model"),
			// The implied inherit in the root layer stack.
			s("root.usda", "/C"),
			s("asset.usda", "/M"),
			s("asset.usda", "/C"),
		]
	);

	// Deleting the authored inherit removes the inherit nodes and nothing
	// else.
	let scene = Scene::new();
	scene.add_layer(LayerBuilder::new("asset.usda").prim("/M").prim("/C").build());
	scene.add_layer(
		LayerBuilder::new("root.usda")
			.prim("/Model")
			.references("/Model", vec![reference("asset.usda", "/M")])
			.build(),
	);
	let outputs = scene.compute("root.usda", "/Model");
	assert_eq!(
		site_strings(&outputs.prim_index),
		vec![s("root.usda", "/Model"), s("asset.usda", "/M")]
	);
}

#[test]
fn specializes_are_weakest() {
	let scene = Scene::new();
	scene.add_layer(LayerBuilder::new("a.usda").prim("/A").build());
	scene.add_layer(
		LayerBuilder::new("root.usda")
			.prim("/P")
			.prim("/S")
			.references("/P", vec![reference("a.usda", "/A")])
			.specializes("/P", &["/S"])
			.build(),
	);

	let outputs = scene.compute("root.usda", "/P");

	assert!(outputs.all_errors.is_empty(), "{:?}", outputs.all_errors);
	assert_eq!(
		site_strings(&outputs.prim_index),
		vec![
			s("root.usda", "/P"),
			s("a.usda", "/A"),
			s("root.usda", "/S"),
		]
	);
}

#[test]
fn variant_fallback_selects_option() {
	let scene = Scene::new();
	scene.add_layer(
		LayerBuilder::new("root.usda")
			.prim("/P")
			.prim("/P{v=a}")
			.prim("/P{v=b}")
			.variant_sets("/P", &["v"])
			.build(),
	);

	let mut inputs = scene.inputs();
	inputs
		.variant_fallbacks
		.insert("v".to_string(), vec!["b".to_string()]);

	let outputs = scene.compute_with("root.usda", "/P", &inputs);

	assert!(outputs.all_errors.is_empty(), "{:?}", outputs.all_errors);
	assert_eq!(
		site_strings(&outputs.prim_index),
		vec![s("root.usda", "/P"), s("root.usda", "/P{v=b}")]
	);
}

#[test]
fn authored_variant_selection_wins_over_fallback() {
	let scene = Scene::new();
	scene.add_layer(
		LayerBuilder::new("root.usda")
			.prim("/P")
			.prim("/P{v=a}")
			.prim("/P{v=a}Inner")
			.prim("/P{v=b}")
			.variant_sets("/P", &["v"])
			.variant_selections("/P", &[("v", "a")])
			.build(),
	);

	let mut inputs = scene.inputs();
	inputs
		.variant_fallbacks
		.insert("v".to_string(), vec!["b".to_string()]);

	let outputs = scene.compute_with("root.usda", "/P", &inputs);

	assert!(outputs.all_errors.is_empty(), "{:?}", outputs.all_errors);
	assert_eq!(
		site_strings(&outputs.prim_index),
		vec![s("root.usda", "/P"), s("root.usda", "/P{v=a}")]
	);
	assert_eq!(child_names(&outputs.prim_index), vec!["Inner".to_string()]);
}

#[test]
fn payload_excluded_by_include_set() {
	let scene = Scene::new();
	scene.add_layer(LayerBuilder::new("a.usda").prim("/A").build());
	scene.add_layer(
		LayerBuilder::new("root.usda")
			.prim("/P")
			.payloads("/P", vec![payload("a.usda", "/A")])
			.build(),
	);

	let mut inputs = scene.inputs();
	inputs.included_payloads = Some(Arc::new(pcp::PayloadSet::default()));

	let outputs = scene.compute_with("root.usda", "/P", &inputs);

	assert!(outputs.prim_index.has_payloads());
	assert_eq!(outputs.payload_state, pcp::PayloadState::ExcludedByIncludeSet);
	assert_eq!(
		site_strings(&outputs.prim_index),
		vec![s("root.usda", "/P")]
	);
}

#[test]
fn payload_included_by_include_set() {
	let scene = Scene::new();
	scene.add_layer(LayerBuilder::new("a.usda").prim("/A").build());
	scene.add_layer(
		LayerBuilder::new("root.usda")
			.prim("/P")
			.payloads("/P", vec![payload("a.usda", "/A")])
			.build(),
	);

	let included = Arc::new(pcp::PayloadSet::default());
	included.insert(sdf::Path::from("/P"));
	let mut inputs = scene.inputs();
	inputs.included_payloads = Some(included);

	let outputs = scene.compute_with("root.usda", "/P", &inputs);

	assert!(outputs.prim_index.has_payloads());
	assert_eq!(outputs.payload_state, pcp::PayloadState::IncludedByIncludeSet);
	assert_eq!(
		site_strings(&outputs.prim_index),
		vec![s("root.usda", "/P"), s("a.usda", "/A")]
	);
}

#[test]
fn reference_cycle_is_rejected() {
	let scene = Scene::new();
	scene.add_layer(
		LayerBuilder::new("root.usda")
			.prim("/A")
			.references("/A", vec![reference("", "/A")])
			.build(),
	);

	let outputs = scene.compute("root.usda", "/A");

	let cycles: Vec<_> = outputs
		.all_errors
		.iter()
		.filter(|e| matches!(e, pcp::PcpError::ArcCycle { .. }))
		.collect();
	assert_eq!(cycles.len(), 1);
	assert_eq!(
		site_strings(&outputs.prim_index),
		vec![s("root.usda", "/A")]
	);
}

#[test]
fn relocation_elides_ancestral_reference() {
	let scene = Scene::new();
	scene.add_layer(
		LayerBuilder::new("model.usda")
			.prim("/M")
			.prim("/M/B")
			.prim("/M/C")
			.build(),
	);
	scene.add_layer(
		LayerBuilder::new("root.usda")
			.prim("/A")
			.references("/A", vec![reference("model.usda", "/M")])
			.relocates(&[("/A/B", "/A/C")])
			.build(),
	);

	let outputs = scene.compute("root.usda", "/A/C");
	let sites = site_strings(&outputs.prim_index);

	// The relocation source subtree is present with its ancestral
	// reference.
	assert!(sites.contains(&s("root.usda", "/A/C")));
	assert!(sites.contains(&s("root.usda", "/A/B")));
	assert!(sites.contains(&s("model.usda", "/M/B")));

	// The ancestral reference subtree at the relocation target is elided.
	assert!(!sites.contains(&s("model.usda", "/M/C")));
}

#[test]
fn relocation_renames_composed_children() {
	let scene = Scene::new();
	scene.add_layer(
		LayerBuilder::new("model.usda")
			.prim("/M")
			.prim("/M/B")
			.build(),
	);
	scene.add_layer(
		LayerBuilder::new("root.usda")
			.prim("/A")
			.references("/A", vec![reference("model.usda", "/M")])
			.relocates(&[("/A/B", "/A/C")])
			.build(),
	);

	let outputs = scene.compute("root.usda", "/A");
	assert_eq!(child_names(&outputs.prim_index), vec!["C".to_string()]);
}

#[test]
fn default_prim_used_for_empty_target() {
	let scene = Scene::new();
	scene.add_layer(
		LayerBuilder::new("asset.usda")
			.prim("/M")
			.default_prim("M")
			.build(),
	);
	scene.add_layer(
		LayerBuilder::new("root.usda")
			.prim("/Model")
			.references("/Model", vec![reference("asset.usda", "")])
			.build(),
	);

	let outputs = scene.compute("root.usda", "/Model");

	assert!(outputs.all_errors.is_empty(), "{:?}", outputs.all_errors);
	assert_eq!(
		site_strings(&outputs.prim_index),
		vec![s("root.usda", "/Model"), s("asset.usda", "/M")]
	);
}

#[test]
fn missing_default_prim_reports_unresolved() {
	let scene = Scene::new();
	scene.add_layer(LayerBuilder::new("asset.usda").prim("/M").build());
	scene.add_layer(
		LayerBuilder::new("root.usda")
			.prim("/Model")
			.references("/Model", vec![reference("asset.usda", "")])
			.build(),
	);

	let outputs = scene.compute("root.usda", "/Model");

	assert!(
		outputs
			.all_errors
			.iter()
			.any(|e| matches!(e, pcp::PcpError::UnresolvedPrimPath { .. }))
	);
}

#[test]
fn unresolved_asset_reports_error() {
	let scene = Scene::new();
	scene.add_layer(
		LayerBuilder::new("root.usda")
			.prim("/Model")
			.references("/Model", vec![reference("missing.usda", "/M")])
			.build(),
	);

	let outputs = scene.compute("root.usda", "/Model");

	assert!(
		outputs
			.all_errors
			.iter()
			.any(|e| matches!(e, pcp::PcpError::InvalidAssetPath { .. }))
	);
	assert_eq!(
		site_strings(&outputs.prim_index),
		vec![s("root.usda", "/Model")]
	);
}

#[test]
fn muted_asset_reports_error() {
	let scene = Scene::new();
	scene.add_layer(LayerBuilder::new("asset.usda").prim("/M").build());
	scene.add_layer(
		LayerBuilder::new("root.usda")
			.prim("/Model")
			.references("/Model", vec![reference("asset.usda", "/M")])
			.build(),
	);
	scene.resolver.mute("asset.usda");

	let outputs = scene.compute("root.usda", "/Model");

	assert!(
		outputs
			.all_errors
			.iter()
			.any(|e| matches!(e, pcp::PcpError::MutedAssetPath { .. }))
	);
	assert_eq!(
		site_strings(&outputs.prim_index),
		vec![s("root.usda", "/Model")]
	);
}

#[test]
fn invalid_layer_offset_keeps_arc() {
	let scene = Scene::new();
	scene.add_layer(LayerBuilder::new("asset.usda").prim("/M").build());

	let mut bad = reference("asset.usda", "/M");
	bad.layer_offset = sdf::Retiming::new(0.0, 0.0);
	scene.add_layer(
		LayerBuilder::new("root.usda")
			.prim("/Model")
			.references("/Model", vec![bad])
			.build(),
	);

	let outputs = scene.compute("root.usda", "/Model");

	assert!(
		outputs
			.all_errors
			.iter()
			.any(|e| matches!(e, pcp::PcpError::InvalidReferenceOffset { .. }))
	);
	// The arc survives with the offset reset.
	assert_eq!(
		site_strings(&outputs.prim_index),
		vec![s("root.usda", "/Model"), s("asset.usda", "/M")]
	);
}

#[test]
fn private_arc_target_is_denied() {
	let scene = Scene::new();
	scene.add_layer(
		LayerBuilder::new("asset.usda")
			.prim("/M")
			.permission("/M", sdf::Permission::Private)
			.build(),
	);
	scene.add_layer(
		LayerBuilder::new("root.usda")
			.prim("/Model")
			.references("/Model", vec![reference("asset.usda", "/M")])
			.build(),
	);

	let outputs = scene.compute("root.usda", "/Model");

	assert!(
		outputs
			.all_errors
			.iter()
			.any(|e| matches!(e, pcp::PcpError::ArcPermissionDenied { .. }))
	);
	// The node is kept, inert, for dependency tracking.
	let index = &outputs.prim_index;
	let nodes = index.nodes_in_strength_order();
	assert_eq!(nodes.len(), 2);
	assert!(index.graph.nodes[nodes[1] as usize].inert);
}

#[test]
fn stronger_opinion_over_private_site_is_restricted() {
	// /A/B is private inside the referenced asset; the root layer's
	// override of /Model/B violates that permission.
	let scene = Scene::new();
	scene.add_layer(
		LayerBuilder::new("a.usda")
			.prim("/A")
			.prim("/A/B")
			.permission("/A/B", sdf::Permission::Private)
			.build(),
	);
	scene.add_layer(
		LayerBuilder::new("root.usda")
			.prim("/Model")
			.prim("/Model/B")
			.references("/Model", vec![reference("a.usda", "/A")])
			.build(),
	);

	let outputs = scene.compute("root.usda", "/Model/B");

	assert!(
		outputs
			.all_errors
			.iter()
			.any(|e| matches!(e, pcp::PcpError::PrimPermissionDenied { .. }))
	);
	assert!(outputs.prim_index.graph.nodes[0].restricted);

	// The restricted root is excluded from the prim stack; the private
	// site's own opinions remain.
	let stack = outputs.prim_index.prim_stack();
	assert_eq!(stack.len(), 1);
	assert_eq!(stack[0].1.identifier(), "a.usda");
}

#[test]
fn sublayer_opinions_compose() {
	let scene = Scene::new();
	scene.add_layer(LayerBuilder::new("sub.usda").prim("/Model").prim("/Model/Y").build());
	scene.add_layer(
		LayerBuilder::new("root.usda")
			.prim("/Model")
			.prim("/Model/X")
			.sub_layers(&["sub.usda"])
			.build(),
	);

	let outputs = scene.compute("root.usda", "/Model");

	assert!(outputs.all_errors.is_empty(), "{:?}", outputs.all_errors);
	assert_eq!(
		site_strings(&outputs.prim_index),
		vec![s("root.usda", "/Model")]
	);
	assert_eq!(
		child_names(&outputs.prim_index),
		vec!["X".to_string(), "Y".to_string()]
	);
}

#[test]
fn acyclicity_invariant() {
	let scene = Scene::new();
	scene.add_layer(
		LayerBuilder::new("asset.usda")
			.prim("/M")
			.prim("/C")
			.inherits("/M", &["/C"])
			.build(),
	);
	scene.add_layer(
		LayerBuilder::new("root.usda")
			.prim("/Model")
			.references("/Model", vec![reference("asset.usda", "/M")])
			.build(),
	);

	let outputs = scene.compute("root.usda", "/Model");
	let graph = &outputs.prim_index.graph;

	for start in 0..graph.nodes.len() as u16 {
		let mut seen = 0;
		let mut current = start;
		while graph.nodes[current as usize].parent_index != pcp::INVALID_NODE_INDEX {
			current = graph.nodes[current as usize].parent_index;
			seen += 1;
			assert!(seen <= graph.nodes.len(), "parent chain does not terminate");
		}
		assert_eq!(current, 0, "parent chain must end at the root");
	}
}

#[test]
fn strength_order_is_deterministic() {
	let build = || {
		let scene = Scene::new();
		scene.add_layer(
			LayerBuilder::new("asset.usda")
				.prim("/M")
				.prim("/M/X")
				.prim("/C")
				.prim("/S")
				.inherits("/M", &["/C"])
				.specializes("/M", &["/S"])
				.build(),
		);
		scene.add_layer(
			LayerBuilder::new("root.usda")
				.prim("/Model")
				.references("/Model", vec![reference("asset.usda", "/M")])
				.build(),
		);
		let outputs = scene.compute("root.usda", "/Model");
		site_strings(&outputs.prim_index)
	};

	let first = build();
	let second = build();
	assert_eq!(first, second);
	assert!(!first.is_empty());
}

#[test]
fn culling_preserves_composition() {
	let scene = Scene::new();
	scene.add_layer(
		LayerBuilder::new("asset.usda")
			.prim("/M")
			.prim("/M/X")
			.prim("/C")
			.inherits("/M", &["/C"])
			.build(),
	);
	scene.add_layer(
		LayerBuilder::new("root.usda")
			.prim("/Model")
			.prim("/Model/Local")
			.references("/Model", vec![reference("asset.usda", "/M")])
			.build(),
	);

	let culled = scene.compute_with("root.usda", "/Model/X", &{
		let mut inputs = scene.inputs();
		inputs.cull = true;
		inputs
	});
	let unculled = scene.compute_with("root.usda", "/Model/X", &{
		let mut inputs = scene.inputs();
		inputs.cull = false;
		inputs
	});

	let culled_sites = site_strings(&culled.prim_index);
	let unculled_sites = site_strings(&unculled.prim_index);

	for site in &culled_sites {
		assert!(
			unculled_sites.contains(site),
			"culled graph has site {site:?} missing from unculled graph"
		);
	}
	assert!(culled_sites.len() <= unculled_sites.len());

	assert_eq!(child_names(&culled.prim_index), child_names(&unculled.prim_index));
}

#[test]
fn parallel_computation_is_deterministic() {
	let scene = Scene::new();
	scene.add_layer(
		LayerBuilder::new("asset.usda")
			.prim("/M")
			.prim("/C")
			.inherits("/M", &["/C"])
			.build(),
	);
	scene.add_layer(
		LayerBuilder::new("root.usda")
			.prim("/Model")
			.prim("/Other")
			.references("/Model", vec![reference("asset.usda", "/M")])
			.references("/Other", vec![reference("asset.usda", "/M")])
			.build(),
	);

	let sequential_model = site_strings(&scene.compute("root.usda", "/Model").prim_index);
	let sequential_other = site_strings(&scene.compute("root.usda", "/Other").prim_index);

	let scene = Arc::new(scene);
	let model_scene = scene.clone();
	let model = std::thread::spawn(move || {
		site_strings(&model_scene.compute("root.usda", "/Model").prim_index)
	});
	let other_scene = scene.clone();
	let other = std::thread::spawn(move || {
		site_strings(&other_scene.compute("root.usda", "/Other").prim_index)
	});

	assert_eq!(model.join().unwrap(), sequential_model);
	assert_eq!(other.join().unwrap(), sequential_other);
}

#[test]
fn ancestral_opinions_from_parent_reference() {
	let scene = Scene::new();
	scene.add_layer(
		LayerBuilder::new("asset.usda")
			.prim("/M")
			.prim("/M/X")
			.prim("/M/X/Deep")
			.build(),
	);
	scene.add_layer(
		LayerBuilder::new("root.usda")
			.prim("/Model")
			.references("/Model", vec![reference("asset.usda", "/M")])
			.build(),
	);

	let outputs = scene.compute("root.usda", "/Model/X");

	assert!(outputs.all_errors.is_empty(), "{:?}", outputs.all_errors);
	assert_eq!(
		site_strings(&outputs.prim_index),
		vec![s("root.usda", "/Model/X"), s("asset.usda", "/M/X")]
	);
	assert_eq!(child_names(&outputs.prim_index), vec!["Deep".to_string()]);
}

#[test]
fn variant_selection_across_reference() {
	// The referencing layer's selection is stronger than the one authored
	// inside the referenced asset.
	let scene = Scene::new();
	scene.add_layer(
		LayerBuilder::new("asset.usda")
			.prim("/M")
			.prim("/M{v=low}")
			.prim("/M{v=high}")
			.prim("/M{v=high}Geo")
			.variant_sets("/M", &["v"])
			.variant_selections("/M", &[("v", "low")])
			.build(),
	);
	scene.add_layer(
		LayerBuilder::new("root.usda")
			.prim("/Model")
			.references("/Model", vec![reference("asset.usda", "/M")])
			.variant_selections("/Model", &[("v", "high")])
			.build(),
	);

	let outputs = scene.compute("root.usda", "/Model");

	assert!(outputs.all_errors.is_empty(), "{:?}", outputs.all_errors);
	assert_eq!(
		site_strings(&outputs.prim_index),
		vec![
			s("root.usda", "/Model"),
			s("asset.usda", "/M"),
			s("asset.usda", "/M{v=high}"),
		]
	);
	assert_eq!(child_names(&outputs.prim_index), vec!["Geo".to_string()]);
}

#[test]
fn expression_variables_in_selection() {
	use opencomp_rs::vt;
	use std::collections::BTreeMap;

	let scene = Scene::new();
	let variables: BTreeMap<String, String> =
		[("WHICH".to_string(), "a".to_string())].into_iter().collect();
	scene.add_layer(
		LayerBuilder::new("root.usda")
			.prim("/P")
			.prim("/P{v=a}")
			.prim("/P{v=b}")
			.variant_sets("/P", &["v"])
			.variant_selections("/P", &[("v", "${WHICH}")])
			.field(
				"/",
				&sdf::FIELD_KEYS.expression_variables,
				vt::Value::StringMap(variables),
			)
			.build(),
	);

	let outputs = scene.compute("root.usda", "/P");

	assert_eq!(
		site_strings(&outputs.prim_index),
		vec![s("root.usda", "/P"), s("root.usda", "/P{v=a}")]
	);
	let consulted = outputs
		.expression_variables_dependency
		.get("root.usda")
		.expect("expression variable dependency must be recorded");
	assert!(consulted.contains("WHICH"));
}
