// rave-overlay: declarative override layers streamed into tenant VMs.
//
// A layer is a directory of guest files plus pattern-driven metadata; it is
// packaged as a tar.gz with a manifest and applied on the guest through an
// argv-parameterized script that diffs against the previously applied state.

pub mod apply;
pub mod layer;
pub mod metadata;
pub mod package;

pub use layer::{Layer, LayerConfig, LayerStats, OverrideStore, DEFAULT_LAYER_PRIORITY};
pub use metadata::{MetadataPolicy, ResolvedMetadata};
pub use package::{LayerPackage, Manifest, ManifestEntry, MANIFEST_FILE_NAME, MANIFEST_VERSION};
