//! Stop-marker handling
//!
//! Two pieces share the marker set: the trimmer cuts finished text at the
//! earliest marker occurrence, and the `StopWatcher` tracks per-sequence
//! completion inside a batched generation loop, where one sequence hitting
//! a marker cannot stop the shared forward pass for the others.

use crate::backend::TokenCodec;

/// Markers every decoder scans for, regardless of family
pub const BASE_EOS: [&str; 3] = ["<|endoftext|>", "<|endofmask|>", "</s>"];

/// Ordered collection of stop markers.
///
/// Families augment the base set, never replace it. Order only breaks ties
/// when two markers first occur at the same index; correctness does not
/// depend on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopMarkerSet {
    markers: Vec<String>,
}

impl StopMarkerSet {
    /// The base end-of-sequence set shared by all backends
    pub fn base() -> Self {
        Self {
            markers: BASE_EOS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Appends family- or checkpoint-specific markers
    pub fn extend<I, S>(&mut self, extra: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.markers.extend(extra.into_iter().map(Into::into));
    }

    /// Base set plus the given extras, in order
    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::base();
        set.extend(extra);
        set
    }

    pub fn markers(&self) -> &[String] {
        &self.markers
    }

    /// Returns true if any marker occurs in `text`
    pub fn matches(&self, text: &str) -> bool {
        self.markers.iter().any(|m| text.contains(m))
    }

    /// First marker (in set order) occurring in `text`, if any
    pub fn first_match<'a>(&'a self, text: &str) -> Option<&'a str> {
        self.markers
            .iter()
            .find(|m| text.contains(m.as_str()))
            .map(|m| m.as_str())
    }

    /// Truncates `text` at the earliest occurrence of any marker.
    ///
    /// The result is always a prefix of `text`; unchanged when no marker
    /// occurs, empty when a marker sits at index 0. Runs after every
    /// backend's raw decode: remote APIs still emit trailing code-fence
    /// closers and continuation text.
    pub fn trim<'a>(&self, text: &'a str) -> &'a str {
        let cut = self
            .markers
            .iter()
            .filter_map(|m| text.find(m.as_str()))
            .min();
        match cut {
            Some(index) => &text[..index],
            None => text,
        }
    }
}

/// Per-sequence completion record
#[derive(Debug, Clone, Default)]
struct SequenceState {
    finished: bool,
    /// Generated-token count at first marker sighting, excluding the
    /// tokens that encode the matched marker. Absent when the budget ran
    /// out before any marker appeared.
    end_length: Option<usize>,
}

/// Early-stop evaluator for batched autoregressive generation.
///
/// The backend calls `step` once per token advance with the text decoded
/// from the prompt boundary onward for every batch slot. A sequence is
/// recorded complete exactly once, the first time any marker appears in
/// its decoded suffix. Generation halts only when every slot is complete
/// or the token budget runs out; per-slot bookkeeping exists so each
/// sequence can be truncated correctly after the shared loop ends.
///
/// The recorded length subtracts the matched marker's re-encoded token
/// count. Re-encoding is approximate when the marker's tokenization is
/// context-dependent near the boundary; the text-level trim pass that
/// follows bounds the effect. Do not "fix" this without re-validating
/// against reference outputs.
#[derive(Debug)]
pub struct StopWatcher {
    markers: StopMarkerSet,
    sequences: Vec<SequenceState>,
}

impl StopWatcher {
    /// Creates a watcher for `batch` in-flight sequences
    pub fn new(batch: usize, markers: StopMarkerSet) -> Self {
        Self {
            markers,
            sequences: vec![SequenceState::default(); batch],
        }
    }

    /// Evaluates one generation step.
    ///
    /// `partial_decodes[i]` is the text decoded for slot `i` from the
    /// prompt boundary onward; `generated_len` is the number of tokens
    /// generated so far (shared across the batch, since all slots advance
    /// together). Returns true when every slot has finished.
    pub fn step(
        &mut self,
        partial_decodes: &[String],
        generated_len: usize,
        codec: &dyn TokenCodec,
    ) -> bool {
        debug_assert_eq!(partial_decodes.len(), self.sequences.len());

        for (state, decoded) in self.sequences.iter_mut().zip(partial_decodes) {
            if state.finished {
                continue;
            }
            if let Some(marker) = self.markers.first_match(decoded) {
                let marker_tokens = match codec.encode(marker) {
                    Ok(tokens) => tokens.len(),
                    Err(e) => {
                        tracing::warn!("Failed to re-encode stop marker {:?}: {}", marker, e);
                        0
                    }
                };
                state.finished = true;
                state.end_length = Some(generated_len.saturating_sub(marker_tokens));
            }
        }

        self.sequences.iter().all(|s| s.finished)
    }

    /// Recorded completion length for slot `index`, if a marker was seen
    pub fn end_length(&self, index: usize) -> Option<usize> {
        self.sequences.get(index).and_then(|s| s.end_length)
    }

    /// Returns true if slot `index` has hit a stop marker
    pub fn is_finished(&self, index: usize) -> bool {
        self.sequences.get(index).is_some_and(|s| s.finished)
    }

    /// Number of tracked sequences
    pub fn batch_len(&self) -> usize {
        self.sequences.len()
    }

    /// The marker set this watcher scans
    pub fn markers(&self) -> &StopMarkerSet {
        &self.markers
    }
}
