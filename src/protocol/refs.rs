//! Parsing of the receive-pack command section. The SSH bridge tees the
//! client's stream through [`PushSniffer`] so a completed push can be turned
//! into trigger events without interfering with git itself.

use bytes::{Bytes, BytesMut};

use crate::errors::{ForgeError, Result};
use crate::protocol::pkt::{Packet, read_packet, read_token};

/// Upper bound on the command section the sniffer will buffer. Ref update
/// commands are tiny; anything larger is a malformed or hostile stream.
const MAX_COMMAND_SECTION: usize = 64 * 1024;

/// Kind of ref being updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Branch,
    Tag,
}

/// One `old-id new-id refname` command from a push.
#[derive(Debug, Clone, PartialEq)]
pub struct RefUpdate {
    pub old_id: String,
    pub new_id: String,
    pub name: String,
    pub kind: RefKind,
}

impl RefUpdate {
    fn from_line(old_id: String, new_id: String, name: String) -> Result<Self> {
        for id in [&old_id, &new_id] {
            let ok = (id.len() == 40 || id.len() == 64)
                && id.bytes().all(|b| b.is_ascii_hexdigit());
            if !ok {
                return Err(ForgeError::InvalidInput(format!(
                    "malformed object id in ref update: {id}"
                )));
            }
        }
        if !name.starts_with("refs/") {
            return Err(ForgeError::InvalidInput(format!(
                "ref name outside refs/: {name}"
            )));
        }
        let kind = if name.starts_with("refs/tags/") {
            RefKind::Tag
        } else {
            RefKind::Branch
        };
        Ok(Self {
            old_id,
            new_id,
            name,
            kind,
        })
    }

    fn zero(id: &str) -> bool {
        id.bytes().all(|b| b == b'0')
    }

    pub fn is_create(&self) -> bool {
        Self::zero(&self.old_id)
    }

    pub fn is_delete(&self) -> bool {
        Self::zero(&self.new_id)
    }

    /// Branch short name, when this update targets `refs/heads/`.
    pub fn branch(&self) -> Option<&str> {
        self.name.strip_prefix("refs/heads/")
    }
}

/// Incremental parser fed with the client's receive-pack bytes. It consumes
/// pkt-lines until the first flush packet (the end of the command section)
/// and ignores everything after, which is pack data.
#[derive(Debug, Default)]
pub struct PushSniffer {
    buffer: BytesMut,
    updates: Vec<RefUpdate>,
    done: bool,
}

impl PushSniffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of client data. Errors indicate a malformed command
    /// section; the caller closes the connection on them.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.buffer.extend_from_slice(chunk);

        let mut view: Bytes = self.buffer.clone().freeze();
        let mut consumed_updates = Vec::new();
        let mut consumed = 0usize;
        loop {
            let before = view.len();
            match read_packet(&mut view)? {
                None => break,
                Some(Packet::Flush) => {
                    consumed += before - view.len();
                    self.done = true;
                    break;
                }
                Some(Packet::Data(mut line)) => {
                    consumed += before - view.len();
                    let old_id = read_token(&mut line);
                    let new_id = read_token(&mut line);
                    // Capabilities ride behind a NUL on the first command;
                    // read_token already stops at it.
                    let name = read_token(&mut line);
                    consumed_updates.push(RefUpdate::from_line(old_id, new_id, name)?);
                }
            }
        }

        let _ = self.buffer.split_to(consumed);
        self.updates.extend(consumed_updates);

        // The bound applies to the unparsed command section only; pack data
        // after the flush never accumulates here.
        if !self.done && self.buffer.len() > MAX_COMMAND_SECTION {
            return Err(ForgeError::InvalidInput(
                "receive-pack command section exceeds bound".into(),
            ));
        }
        Ok(())
    }

    /// Whether the command section has been fully consumed.
    pub fn is_complete(&self) -> bool {
        self.done
    }

    /// Parsed updates; complete once [`PushSniffer::is_complete`] is true.
    pub fn updates(&self) -> &[RefUpdate] {
        &self.updates
    }

    pub fn into_updates(self) -> Vec<RefUpdate> {
        self.updates
    }
}
