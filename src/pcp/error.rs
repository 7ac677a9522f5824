use super::{ArcType, LayerStackSite};
use crate::sdf;
use thiserror::Error;

/// A site in error reports: the layer stack's identifier plus the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorSite {
	pub layer_stack: String,
	pub path: sdf::Path,
}

impl ErrorSite {
	pub fn new(site: &LayerStackSite) -> Self {
		Self {
			layer_stack: site.layer_stack.identifier().to_string(),
			path: site.path.clone(),
		}
	}
}

impl std::fmt::Display for ErrorSite {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "@{}@<{}>", self.layer_stack, self.path)
	}
}

/// One arc along a reported cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleSegment {
	pub site: ErrorSite,
	pub arc_type: ArcType,
}

fn format_cycle(cycle: &[CycleSegment]) -> String {
	cycle
		.iter()
		.map(|seg| format!("{} ({})", seg.site, seg.arc_type))
		.collect::<Vec<_>>()
		.join(" -> ")
}

/// Errors raised while building a prim index.
///
/// Composition errors never abort construction; they are recorded on the
/// outputs and the indexer continues with the offending arc skipped or
/// replaced by a placeholder.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PcpError {
	#[error("arc to {site} would create a cycle: {}", format_cycle(.cycle))]
	ArcCycle {
		root_site: ErrorSite,
		site: ErrorSite,
		cycle: Vec<CycleSegment>,
	},

	#[error("{arc_type} arc from {site} targets private site {private_site}")]
	ArcPermissionDenied {
		root_site: ErrorSite,
		site: ErrorSite,
		private_site: ErrorSite,
		arc_type: ArcType,
	},

	#[error("opinions at {site} are not permitted over private site {private_site}")]
	PrimPermissionDenied {
		root_site: ErrorSite,
		site: ErrorSite,
		private_site: ErrorSite,
	},

	#[error("{arc_type} at {site} targets invalid prim path <{prim_path}>")]
	InvalidPrimPath {
		root_site: ErrorSite,
		site: ErrorSite,
		prim_path: sdf::Path,
		arc_type: ArcType,
	},

	#[error(
		"{arc_type} at @{source_layer}@<{source_path}> to @{asset_path}@ has non-invertible layer offset {offset:?}"
	)]
	InvalidReferenceOffset {
		root_site: ErrorSite,
		source_layer: String,
		source_path: sdf::Path,
		asset_path: String,
		offset: sdf::Retiming,
		arc_type: ArcType,
	},

	#[error("{arc_type} at {site} targets <{unresolved_path}> which has no prim spec in @{target_layer}@")]
	UnresolvedPrimPath {
		root_site: ErrorSite,
		site: ErrorSite,
		target_layer: String,
		unresolved_path: sdf::Path,
		arc_type: ArcType,
	},

	#[error("{arc_type} at {site} could not open layer @{asset_path}@ (resolved: '{resolved_path}')")]
	InvalidAssetPath {
		root_site: ErrorSite,
		site: ErrorSite,
		asset_path: String,
		resolved_path: String,
		arc_type: ArcType,
	},

	#[error("{arc_type} at {site} targets muted layer @{asset_path}@")]
	MutedAssetPath {
		root_site: ErrorSite,
		site: ErrorSite,
		asset_path: String,
		arc_type: ArcType,
	},

	#[error("opinions authored at relocation source @{layer}@<{path}> will be ignored")]
	OpinionAtRelocationSource {
		root_site: ErrorSite,
		layer: String,
		path: sdf::Path,
	},

	#[error("prim index for {root_site} exceeded the node capacity of its graph")]
	IndexCapacityExceeded { root_site: ErrorSite },

	#[error("prim index for {root_site} exceeded the arc capacity of a node")]
	ArcCapacityExceeded { root_site: ErrorSite },

	#[error("prim index for {root_site} exceeded the namespace depth capacity of an arc")]
	ArcNamespaceDepthCapacityExceeded { root_site: ErrorSite },
}

/// Tracks which capacity errors have been reported, so each category is
/// reported at most once per index.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CapacityFlags {
	pub index_reported: bool,
	pub arc_reported: bool,
	pub depth_reported: bool,
}
