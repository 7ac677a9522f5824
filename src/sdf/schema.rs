use crate::tf;

crate::declare_public_tokens!(FieldKeys, FIELD_KEYS, [
	default_prim: "defaultPrim",
	expression_variables: "expressionVariables",
	inherit_paths: "inheritPaths",
	instanceable: "instanceable",
	layer_relocates: "layerRelocates",
	payload: "payload",
	permission: "permission",
	prim_order: "primOrder",
	references: "references",
	specializes: "specializes",
	sub_layer_offsets: "subLayerOffsets",
	sub_layers: "subLayers",
	symmetry_function: "symmetryFunction",
	timecodes_per_second: "timeCodesPerSecond",
	variant_selection: "variantSelection",
	variant_set_names: "variantSetNames"
]);

crate::declare_public_tokens!(ChildrenKeys, CHILDREN_KEYS, [
	prim_children: "primChildren"
]);
