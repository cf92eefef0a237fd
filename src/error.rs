use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Everything that can end a conversion run early.
///
/// Each variant maps onto a single terminal `ConversionResult::Failure`; none
/// of them are retried. Scratch cleanup problems are not represented here
/// because they never fail a run, they are only logged.
#[derive(Error, Debug)]
pub enum ConvertError {
    /// None of the supplied paths looked like a numbered frame (`0001.png`).
    #[error("no valid numbered frames found (expected names like 0001.png)")]
    NoValidFrames,

    #[error("invalid frame rate {0}: must be a positive number")]
    InvalidFrameRate(f64),

    #[error("failed to create scratch directory in {}: {source}", root.display())]
    Scratch {
        root: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The image transform failed on `path`. Remaining frames were skipped.
    #[error("failed to preprocess {}: {cause:#}", path.display())]
    Preprocess { path: PathBuf, cause: anyhow::Error },

    #[error("failed to launch encoder `{program}`: {source}")]
    EncoderLaunch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("encoder exited with code {0}")]
    EncoderExit(i32),

    #[error("encoder was terminated by a signal")]
    EncoderSignal,

    #[error("failed reading encoder output: {0}")]
    EncoderIo(#[source] io::Error),

    #[error("failed to prepare output location {}: {source}", path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("conversion cancelled")]
    Cancelled,
}

pub type ConvertResult<T> = std::result::Result<T, ConvertError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_message_names_the_code() {
        assert_eq!(ConvertError::EncoderExit(1).to_string(), "encoder exited with code 1");
    }

    #[test]
    fn preprocess_message_names_the_file() {
        let err = ConvertError::Preprocess {
            path: PathBuf::from("/frames/0003.png"),
            cause: anyhow::anyhow!("decode failed"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/frames/0003.png"));
        assert!(msg.contains("decode failed"));
    }
}
