use crate::error::{IngestError, Result};
use log::{debug, warn};
use std::io::{Cursor, Read};
use zip::ZipArchive;

/// Maximum container nesting the extractor will descend into
pub const MAX_DEPTH: u8 = 2;

/// Recursively unpacks in-memory ZIP containers down to CSV payloads
pub struct ArchiveExtractor;

impl ArchiveExtractor {
    /// Lazily walk `bytes`, descending at most `depth` nested containers.
    ///
    /// Fails with `CorruptArchive` only when the outer container cannot be opened;
    /// nested failures surface as items so the caller can skip them.
    pub fn open(name: &str, bytes: Vec<u8>, depth: u8) -> Result<Leaves> {
        let archive = ZipArchive::new(Cursor::new(bytes)).map_err(|source| {
            IngestError::CorruptArchive {
                name: name.to_string(),
                source,
            }
        })?;

        Ok(Leaves {
            stack: vec![Frame {
                name: name.to_string(),
                archive,
                next: 0,
                depth: 0,
            }],
            max_depth: depth.min(MAX_DEPTH),
        })
    }

    /// Every leaf payload, skipping corrupt nested members; `EmptyArchive` when none remain
    pub fn extract_all(name: &str, bytes: Vec<u8>, depth: u8) -> Result<Vec<(String, String)>> {
        let mut payloads = Vec::new();
        for leaf in Self::open(name, bytes, depth)? {
            match leaf {
                Ok(payload) => payloads.push(payload),
                Err(e) => warn!("{}: skipping nested member: {}", name, e),
            }
        }

        if payloads.is_empty() {
            return Err(IngestError::EmptyArchive {
                name: name.to_string(),
            });
        }
        debug!("{}: extracted {} payload(s)", name, payloads.len());
        Ok(payloads)
    }
}

struct Frame {
    name: String,
    archive: ZipArchive<Cursor<Vec<u8>>>,
    next: usize,
    depth: u8,
}

enum Member {
    Skip,
    Container(String, Vec<u8>),
    Leaf(String, Vec<u8>),
}

/// Iterator over `(member_name, text)` for every CSV leaf
pub struct Leaves {
    stack: Vec<Frame>,
    max_depth: u8,
}

impl Leaves {
    fn read_member(frame: &mut Frame, index: usize, max_depth: u8) -> Result<Member> {
        let mut entry = frame
            .archive
            .by_index(index)
            .map_err(|source| IngestError::CorruptArchive {
                name: frame.name.clone(),
                source,
            })?;
        if entry.is_dir() {
            return Ok(Member::Skip);
        }

        let member = entry.name().to_string();
        let lower = member.to_ascii_lowercase();
        let is_container = lower.ends_with(".zip");
        if is_container && frame.depth >= max_depth {
            debug!("{}: not descending into {} beyond depth {}", frame.name, member, max_depth);
            return Ok(Member::Skip);
        }
        if !is_container && !lower.ends_with(".csv") {
            return Ok(Member::Skip);
        }

        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut buf)
            .map_err(|e| IngestError::CorruptArchive {
                name: member.clone(),
                source: zip::result::ZipError::Io(e),
            })?;

        Ok(if is_container {
            Member::Container(member, buf)
        } else {
            Member::Leaf(member, buf)
        })
    }
}

impl Iterator for Leaves {
    type Item = Result<(String, String)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let max_depth = self.max_depth;
            let frame = self.stack.last_mut()?;
            if frame.next >= frame.archive.len() {
                self.stack.pop();
                continue;
            }
            let index = frame.next;
            frame.next += 1;
            let depth = frame.depth;

            match Self::read_member(frame, index, max_depth) {
                Ok(Member::Skip) => continue,
                Ok(Member::Leaf(name, bytes)) => {
                    return Some(Ok((name, String::from_utf8_lossy(&bytes).into_owned())));
                }
                Ok(Member::Container(name, bytes)) => match ZipArchive::new(Cursor::new(bytes)) {
                    Ok(archive) => self.stack.push(Frame {
                        name,
                        archive,
                        next: 0,
                        depth: depth + 1,
                    }),
                    Err(source) => return Some(Err(IngestError::CorruptArchive { name, source })),
                },
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
