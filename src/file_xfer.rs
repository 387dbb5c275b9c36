//! File transfer carried in `FILE_XFER` TLV records.
//!
//! ```text
//! value[0] = 0 NAME     [1..5] length u32 BE, [5..] name\0
//! value[0] = 1 PAYLOAD  [1] chunk length, [2..] chunk
//! value[0] = 2 WRITE    [1..] 32 hex digit MD5 of the whole file\0
//! value[0] = 3 READ     (not supported by this client)
//! value[0] = 4 ERROR    abort the transfer
//! ```

use std::path::{ Path, PathBuf };

use tracing::{ info, warn };

use crate::error::CodecError;
use crate::usrp_protocol::c_str;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileXferCommand<'a> {
    Name {
        length: u32,
        name: String,
    },
    Payload(&'a [u8]),
    Write {
        digest: String,
    },
    Read,
    Error,
}

impl<'a> FileXferCommand<'a> {
    pub fn parse(value: &'a [u8]) -> Result<Self, CodecError> {
        let Some(&cmd) = value.first() else {
            return Err(CodecError::TooShort { len: 0, need: 1 });
        };
        match cmd {
            0 => {
                if value.len() < 5 {
                    return Err(CodecError::TooShort { len: value.len(), need: 5 });
                }
                let length = u32::from_be_bytes([value[1], value[2], value[3], value[4]]);
                let name = String::from_utf8_lossy(c_str(&value[5..])).into_owned();
                Ok(FileXferCommand::Name { length, name })
            }
            1 => {
                if value.len() < 2 {
                    return Err(CodecError::TooShort { len: value.len(), need: 2 });
                }
                let declared = value[1] as usize;
                let available = value.len() - 2;
                if declared > available {
                    return Err(CodecError::Truncated { declared, available });
                }
                Ok(FileXferCommand::Payload(&value[2..2 + declared]))
            }
            2 => {
                let digest = String::from_utf8_lossy(c_str(&value[1..])).trim().to_ascii_lowercase();
                Ok(FileXferCommand::Write { digest })
            }
            3 => Ok(FileXferCommand::Read),
            4 => Ok(FileXferCommand::Error),
            other => Err(CodecError::UnknownFileCommand(other)),
        }
    }
}

/// What one FILE_XFER record did to the transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileXferOutcome {
    Started {
        name: String,
        length: u32,
    },
    Chunk {
        received: usize,
    },
    /// Digest matched; the file content is returned.
    Verified {
        name: String,
        content: Vec<u8>,
    },
    Mismatch {
        name: String,
        expected: String,
        actual: String,
    },
    Aborted,
    /// Record arrived with no transfer in progress, or asked for READ.
    Ignored(&'static str),
}

struct ActiveTransfer {
    name: String,
    declared_len: u32,
    digest: md5::Context,
    content: Vec<u8>,
}

/// Receive-side transfer state: idle or one file in flight.
#[derive(Default)]
pub struct FileTransfer {
    active: Option<ActiveTransfer>,
}

impl FileTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_progress(&self) -> bool {
        self.active.is_some()
    }

    pub fn handle(&mut self, value: &[u8]) -> Result<FileXferOutcome, CodecError> {
        let outcome = match FileXferCommand::parse(value)? {
            FileXferCommand::Name { length, name } => {
                if let Some(old) = &self.active {
                    warn!(file = %old.name, "file transfer replaced before WRITE");
                }
                info!(file = %name, length, "📥 file transfer started");
                self.active = Some(ActiveTransfer {
                    name: name.clone(),
                    declared_len: length,
                    digest: md5::Context::new(),
                    content: Vec::with_capacity(length.min(1 << 20) as usize),
                });
                FileXferOutcome::Started { name, length }
            }
            FileXferCommand::Payload(chunk) =>
                match self.active.as_mut() {
                    Some(t) if t.content.len() + chunk.len() > (t.declared_len as usize) => {
                        warn!(
                            file = %t.name,
                            declared = t.declared_len,
                            received = t.content.len() + chunk.len(),
                            "file transfer overran its declared length, aborting"
                        );
                        self.active = None;
                        FileXferOutcome::Aborted
                    }
                    Some(t) => {
                        t.digest.consume(chunk);
                        t.content.extend_from_slice(chunk);
                        FileXferOutcome::Chunk { received: t.content.len() }
                    }
                    None => FileXferOutcome::Ignored("payload without a file name"),
                }
            FileXferCommand::Write { digest: expected } =>
                match self.active.take() {
                    Some(t) => {
                        let actual = format!("{:x}", t.digest.compute());
                        if (t.content.len() as u64) != (t.declared_len as u64) {
                            warn!(
                                file = %t.name,
                                declared = t.declared_len,
                                received = t.content.len(),
                                "file length differs from NAME record"
                            );
                        }
                        if actual == expected {
                            info!(file = %t.name, bytes = t.content.len(), "✅ file transfer verified");
                            FileXferOutcome::Verified { name: t.name, content: t.content }
                        } else {
                            warn!(file = %t.name, expected = %expected, actual = %actual, "❌ file transfer digest mismatch");
                            FileXferOutcome::Mismatch { name: t.name, expected, actual }
                        }
                    }
                    None => FileXferOutcome::Ignored("write without a file name"),
                }
            FileXferCommand::Read => {
                warn!("file READ requested; not supported");
                FileXferOutcome::Ignored("read not supported")
            }
            FileXferCommand::Error => {
                if let Some(t) = self.active.take() {
                    warn!(file = %t.name, "file transfer aborted by gateway");
                }
                FileXferOutcome::Aborted
            }
        };
        Ok(outcome)
    }
}

/// Write a verified file into `dir`, keeping only the final path component
/// of the sender's name.
pub async fn save_file(dir: &Path, name: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
    let file_name = Path::new(name)
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("unusable file name '{name}'"))?;
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(file_name);
    tokio::fs::write(&path, content).await?;
    Ok(path)
}
