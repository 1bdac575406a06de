//! Session detection, validation and merging for finished captures.
//!
//! Each [`Archiver::run_cycle`] scans the capture root, groups directories
//! into sessions, probes segments while a session is live and writes the
//! manifests once it has ended. Fully manifested sessions go to a single
//! [`MergeWorker`] through the [`MergeQueue`] so merges never overlap.

pub mod archiver;
pub mod companion;
pub mod completion;
pub mod error;
pub mod grouper;
pub mod layout;
pub mod merge;
pub mod probe;
pub mod scan;

pub use archiver::{Archiver, CycleSummary};
pub use companion::{CompanionLocator, NoCompanion, SubtitleLocator};
pub use completion::{CompletionDetector, CompletionSettings, FinalizeOutcome};
pub use error::{ArchiveError, Result};
pub use grouper::{group_sessions, DirSnapshot, GroupingRules, Session, SessionKey};
pub use merge::{
    merge_channel, Concatenator, FfmpegConcat, MergeJob, MergeOutcome, MergeQueue, MergeReport,
    MergeWorker, Merger,
};
pub use probe::{probe_all, FfprobeProber, ProbeVerdict, Prober};
pub use scan::scan_capture_root;
