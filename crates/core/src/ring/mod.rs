//! Fixed-capacity store of interleaved multi-channel frames.
//!
//! Positions are absolute frame counts since start; a position maps to slot
//! `position % capacity`. The ring never resizes and never blocks the writer:
//! once full, each write overwrites the oldest frame.

#[derive(Debug, Clone)]
pub struct FrameRing {
    channels: usize,
    capacity: usize,
    data: Vec<f32>,
    /// Frames written so far; the next write lands at this position.
    write_pointer: u64,
    /// Oldest position not yet covered by an emitted window.
    read_pointer: u64,
}

impl FrameRing {
    /// Allocates a zeroed ring of `capacity` frames.
    pub fn new(channels: usize, capacity: usize) -> Self {
        Self {
            channels,
            capacity,
            data: vec![0.0; channels * capacity],
            write_pointer: 0,
            read_pointer: 0,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn write_pointer(&self) -> u64 {
        self.write_pointer
    }

    pub fn read_pointer(&self) -> u64 {
        self.read_pointer
    }

    /// Position of the most recently written frame.
    pub fn newest(&self) -> Option<u64> {
        self.write_pointer.checked_sub(1)
    }

    /// Oldest position still held in the ring.
    pub fn oldest(&self) -> u64 {
        self.write_pointer.saturating_sub(self.capacity as u64)
    }

    /// Appends one frame. Missing channels are written as zero, extra values
    /// are ignored.
    pub fn write(&mut self, frame: &[f32]) {
        let base = self.slot(self.write_pointer) * self.channels;
        let dest = &mut self.data[base..base + self.channels];
        let n = frame.len().min(self.channels);
        dest[..n].copy_from_slice(&frame[..n]);
        dest[n..].fill(0.0);
        self.write_pointer += 1;
    }

    /// Frame at logical `offset` from the read pointer, if it is still held.
    pub fn read(&self, offset: usize) -> Option<&[f32]> {
        self.frame(self.effective_read_pointer() + offset as u64)
    }

    /// Frame at an absolute position, if it has been written and not yet
    /// overwritten.
    pub fn frame(&self, position: u64) -> Option<&[f32]> {
        if position >= self.write_pointer || position < self.oldest() {
            return None;
        }
        let base = self.slot(position) * self.channels;
        Some(&self.data[base..base + self.channels])
    }

    pub fn sample(&self, position: u64, channel: usize) -> Option<f32> {
        self.frame(position).and_then(|frame| frame.get(channel).copied())
    }

    /// Frames written but not yet exported that are still held.
    pub fn unread(&self) -> usize {
        (self.write_pointer - self.effective_read_pointer()) as usize
    }

    /// Frames lost to overwrite since the read pointer last advanced.
    pub fn overrun(&self) -> u64 {
        self.oldest().saturating_sub(self.read_pointer)
    }

    /// Marks everything before `position` as exported.
    pub fn advance_read(&mut self, position: u64) {
        self.read_pointer = self.read_pointer.max(position.min(self.write_pointer));
    }

    fn effective_read_pointer(&self) -> u64 {
        self.read_pointer.max(self.oldest())
    }

    fn slot(&self, position: u64) -> usize {
        (position % self.capacity as u64) as usize
    }
}
