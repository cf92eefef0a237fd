//! Frame discovery and ordering.
//!
//! Only files named exactly like `0001.png` are treated as frames, which is
//! the default output naming of most 3D and animation packages. Anything else
//! is skipped without complaint.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

use crate::error::{ConvertError, ConvertResult};

static FRAME_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})\.png$").expect("frame name pattern is valid"));

/// A source frame that passed the naming filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSpec {
    /// Index parsed from the file name (`0042.png` -> 42).
    pub index: u32,
    pub source_path: PathBuf,
}

/// Extract the frame index from a path's file name.
///
/// Returns `None` for anything that is not four ASCII digits followed by
/// `.png`.
pub fn frame_index(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    let caps = FRAME_NAME.captures(name)?;
    caps[1].parse().ok()
}

/// Filter `paths` down to numbered frames and sort them by index.
///
/// Gaps in the numbering are kept as-is. Duplicate indices (the same name in
/// two directories) keep the order they were supplied in.
pub fn resolve_frames<I, P>(paths: I) -> ConvertResult<Vec<FrameSpec>>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut frames: Vec<FrameSpec> = paths
        .into_iter()
        .filter_map(|p| {
            let path = p.as_ref();
            frame_index(path).map(|index| FrameSpec {
                index,
                source_path: path.to_path_buf(),
            })
        })
        .collect();

    if frames.is_empty() {
        return Err(ConvertError::NoValidFrames);
    }

    // stable: ties stay in input order
    frames.sort_by_key(|f| f.index);
    Ok(frames)
}
