//! HDF5 conversion handoff.
//!
//! The capture task does not link HDF5 itself; at the end of a job it
//! hands a conversion request across this boundary. The resulting file
//! holds one dataset of `u8`s per descriptor under
//! `/capture/<group>/<name>`.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

/// One dataset, sourced from a file slice or an in-memory buffer.
///
/// With a file source, `offset < 0` counts back from EOF and
/// `length < 0` (or one running past EOF) means "until EOF"; a zero
/// length, or an offset beyond EOF, gives an empty dataset. With a
/// buffer source both must be non-negative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetDesc {
    pub name: String,
    /// Empty when the data comes from `buffer`.
    pub filename: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer: Option<Vec<u8>>,
    pub offset: i64,
    pub length: i64,
}

impl DatasetDesc {
    /// The whole of `filename`, the common case for capture streams.
    pub fn whole_file(name: impl Into<String>, filename: PathBuf) -> Self {
        DatasetDesc { name: name.into(), filename, buffer: None, offset: 0, length: -1 }
    }

    pub fn from_buffer(name: impl Into<String>, buffer: Vec<u8>) -> Self {
        let length = buffer.len() as i64;
        DatasetDesc {
            name: name.into(),
            filename: PathBuf::new(),
            buffer: Some(buffer),
            offset: 0,
            length,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionRequest {
    pub hdf5_path: PathBuf,
    /// Group created under the root group `/capture`; empty means the
    /// datasets go directly under the root group.
    pub group: String,
    pub datasets: Vec<DatasetDesc>,
    /// Insert into an existing file instead of recreating it.
    pub use_existing: bool,
    /// Overwrite an existing file/group instead of aborting.
    pub overwrite: bool,
    /// Move an existing group aside (timestamped) before overwriting.
    pub backup: bool,
    /// Return once the converter has opened its inputs, convert in the
    /// background.
    pub async_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvStatus {
    /// Accepted (async) or converted (sync).
    Ok = 0,
    Malformed = 1,
    /// File or group exists and overwriting was not requested.
    Exists = 2,
    InitError = 3,
    ConvError = 4,
    /// Converted, but cleanup of the source data files failed.
    FinError = 5,
}

impl ConvStatus {
    fn from_code(code: i32) -> ConvStatus {
        match code {
            0 => ConvStatus::Ok,
            1 => ConvStatus::Malformed,
            2 => ConvStatus::Exists,
            3 => ConvStatus::InitError,
            5 => ConvStatus::FinError,
            _ => ConvStatus::ConvError,
        }
    }
}

#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, req: &ConversionRequest) -> ConvStatus;
}

/// Hands the request, as JSON on stdin, to an external converter program.
/// The program's exit code is the conversion status.
pub struct ExternalConverter {
    program: PathBuf,
}

impl ExternalConverter {
    pub fn new(program: PathBuf) -> Self {
        ExternalConverter { program }
    }
}

#[async_trait]
impl Converter for ExternalConverter {
    async fn convert(&self, req: &ConversionRequest) -> ConvStatus {
        let json = match serde_json::to_vec(req) {
            Ok(j) => j,
            Err(e) => {
                log::error!("cannot serialize conversion request: {e}");
                return ConvStatus::Malformed;
            }
        };
        let mut child = match tokio::process::Command::new(&self.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
        {
            Ok(c) => c,
            Err(e) => {
                log::error!("cannot start converter {}: {e}", self.program.display());
                return ConvStatus::InitError;
            }
        };
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&json).await {
                log::error!("cannot hand request to converter: {e}");
                return ConvStatus::InitError;
            }
        }
        if req.async_run {
            // detach: the converter owns the job from here
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(st) if st.success() => {}
                    Ok(st) => log::error!("background conversion failed: {st}"),
                    Err(e) => log::error!("background conversion failed: {e}"),
                }
            });
            return ConvStatus::Ok;
        }
        match child.wait().await {
            Ok(st) => ConvStatus::from_code(st.code().unwrap_or(-1)),
            Err(e) => {
                log::error!("converter did not finish: {e}");
                return ConvStatus::ConvError;
            }
        }
    }
}

/// Accepts every request without converting. Stands in when no converter
/// program is configured, and in tests.
pub struct NullConverter;

#[async_trait]
impl Converter for NullConverter {
    async fn convert(&self, _req: &ConversionRequest) -> ConvStatus {
        ConvStatus::Ok
    }
}
