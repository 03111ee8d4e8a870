use std::fmt::{Display, Formatter};

/// Selects how per-item targets travel through the decode stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetMode {
    /// The decoder produces datum and target together; no per-item
    /// metadata is written.
    ReadContents,
    /// The datum is decoded alone and the encoded target bytes are
    /// copied raw into the fixed target slot.
    RawCopy,
}

/// What to do with a raw-copied target that does not match the fixed
/// slot length. The original encoded length is always recorded in the
/// metadata buffer, so a truncated target remains detectable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetPolicy {
    /// Truncate oversized targets to the slot, zero-pad undersized ones.
    TruncateAndPad,
}

#[derive(Debug)]
pub struct MediaError {
    pub message: String,
}

impl MediaError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl Display for MediaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "media decode failed: {}", self.message)
    }
}

impl std::error::Error for MediaError {}

/// One worker's decoder. Implementations may keep scratch state, so
/// every decode worker owns its own instance, built by a
/// [`MediaFactory`] at pool startup.
pub trait Media: Send {
    /// Decodes one encoded datum into exactly `datum.len()` bytes,
    /// optionally producing one integer of per-item metadata.
    fn transform(&mut self, enc: &[u8], datum: &mut [u8], meta: &mut i32) -> Result<(), MediaError>;

    /// Decodes datum and target together into their fixed slots.
    fn transform_joint(
        &mut self,
        enc_datum: &[u8],
        enc_target: &[u8],
        datum: &mut [u8],
        target: &mut [u8],
    ) -> Result<(), MediaError>;
}

/// Builds the per-worker decoder; called once per worker with the
/// worker's index.
pub type MediaFactory = Box<dyn Fn(usize) -> Box<dyn Media> + Send + Sync>;
