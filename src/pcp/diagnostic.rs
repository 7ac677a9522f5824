use super::ArcType;
use super::graph::{INVALID_NODE_INDEX, PrimIndexGraph};
use super::prim_index::PrimIndex;
use std::io::Write;

/// Write the prim index graph in DOT format for inspection with graphviz.
pub fn dump_dot_graph(index: &PrimIndex, writer: &mut dyn Write) -> std::io::Result<()> {
	writeln!(writer, "digraph PrimIndex {{")?;
	if !index.graph.nodes.is_empty() {
		write_graph(writer, &index.graph, 0)?;
	}
	writeln!(writer, "}}")?;
	Ok(())
}

fn write_graph(
	writer: &mut dyn Write,
	graph: &PrimIndexGraph,
	node_idx: u16,
) -> std::io::Result<()> {
	let node = graph.get_node(node_idx).unwrap();
	let unshared = graph.get_unshared(node_idx).unwrap();

	let mut flags = String::new();
	if node.inert {
		flags.push_str(" inert");
	}
	if node.culled {
		flags.push_str(" culled");
	}
	if node.restricted {
		flags.push_str(" restricted");
	}

	let node_label = format!(
		"@{}@<{}> ({}){}",
		node.layer_stack.identifier(),
		unshared.site_path,
		node_idx,
		flags
	);

	let style = if node.culled { "dashed" } else { "solid" };
	writeln!(
		writer,
		"\t{} [label=\"{}\", shape=\"box\", style=\"{}\"];",
		node_idx, node_label, style
	)?;

	let mut child_idx = node.first_child_index;
	while child_idx != INVALID_NODE_INDEX {
		let child = graph.get_node(child_idx).unwrap();

		let color = match child.arc_type {
			ArcType::Root => "black",
			ArcType::Inherit => "green",
			ArcType::Variant => "orange",
			ArcType::Reference => "red",
			ArcType::Relocate => "purple",
			ArcType::Payload => "indigo",
			ArcType::Specialize => "sienna",
		};

		writeln!(
			writer,
			"\t{} -> {} [label=\"{}\", color={}];",
			node_idx, child_idx, child.arc_type, color
		)?;

		write_graph(writer, graph, child_idx)?;

		child_idx = child.next_sibling_index;
	}

	Ok(())
}
