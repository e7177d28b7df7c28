//! Break state: the debug output of one dispatch, fetched on demand
//!
//! The output file is a flat array of per-lane records:
//!
//! ```text
//! struct lane_data { uint32_t system; uint32_t watches[n_watches]; };
//! lane_data output[group_count][group_size];
//! ```
//!
//! Data is fetched from the server one group at a time. A bitmap with one bit
//! per wavefront (64 lanes) remembers which parts of the buffer are already
//! populated, so navigating back to a group costs no network traffic.

use std::fmt;
use std::ops::Range;
use tokio_util::sync::CancellationToken;

use crate::communication::{Channel, Result};
use crate::parser::BreakStateDispatchParameters;
use crate::types::{FetchResultRange, FetchStatus, Timestamp};

/// Lanes per wavefront; group sizes must be a multiple of it
pub const WAVE_SIZE: usize = 64;

/// Name under which slice views address the system slot
pub const SYSTEM_WATCH: &str = "System";

/// Location and shape of the debug output file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakStateOutputFile {
    pub path: String,
    pub binary_output: bool,
    /// Header bytes (or lines, for text output) preceding the data
    pub offset: u32,
    /// Modification time observed when the run finished
    pub timestamp: Timestamp,
    pub dword_count: usize,
}

/// Fixed-size bit set, one bit per wavefront chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchBitmap {
    words: Vec<u64>,
    len: usize,
}

impl FetchBitmap {
    pub fn new(len: usize) -> Self {
        Self { words: vec![0; (len + 63) / 64], len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> bool {
        index < self.len && self.words[index / 64] & (1 << (index % 64)) != 0
    }

    pub fn set(&mut self, index: usize) {
        if index < self.len {
            self.words[index / 64] |= 1 << (index % 64);
        }
    }

    pub fn set_range(&mut self, range: Range<usize>) {
        for index in range {
            self.set(index);
        }
    }

    pub fn set_all(&mut self) {
        self.set_range(0..self.len);
    }

    /// True if every bit in `range` is set; an empty range is trivially covered.
    pub fn all_set(&self, range: Range<usize>) -> bool {
        range.into_iter().all(|index| self.get(index))
    }

    pub fn first_unset(&self) -> Option<usize> {
        (0..self.len).find(|&index| !self.get(index))
    }

    pub fn last_unset(&self) -> Option<usize> {
        (0..self.len).rev().find(|&index| !self.get(index))
    }
}

/// Lane-indexed view of one watch within the selected group
#[derive(Clone, Copy)]
pub struct WatchView<'a> {
    data: &'a [u8],
    start_dword: usize,
    lane_data_size: usize,
    len: usize,
}

impl<'a> WatchView<'a> {
    fn new(data: &'a [u8], group_index: usize, group_size: usize, slot: usize, lane_data_size: usize) -> Self {
        let total_dwords = data.len() / 4;
        let group_offset = group_index.saturating_mul(group_size).saturating_mul(lane_data_size);
        // The last group may be cut short by the end of the file
        let items_in_group = total_dwords.saturating_sub(group_offset) / lane_data_size;
        Self {
            data,
            start_dword: group_offset.saturating_add(slot),
            lane_data_size,
            len: group_size.min(items_in_group),
        }
    }

    /// Number of addressable lanes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, lane: usize) -> Option<u32> {
        if lane >= self.len {
            return None;
        }
        read_dword(self.data, self.start_dword + lane * self.lane_data_size)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + 'a {
        let view = *self;
        (0..view.len).filter_map(move |lane| view.get(lane))
    }
}

impl fmt::Debug for WatchView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// One watch across many groups, laid out as a matrix with `groups_in_row`
/// groups per row. Min and max are computed once at construction.
#[derive(Debug, Clone)]
pub struct SliceWatchView<'a> {
    data: &'a [u8],
    slot: usize,
    lane_data_size: usize,
    group_size: usize,
    groups_in_row: usize,
    valid_lanes: usize,
    column_count: usize,
    row_count: usize,
    min: u32,
    max: u32,
}

impl<'a> SliceWatchView<'a> {
    fn new(
        data: &'a [u8],
        groups_in_row: usize,
        group_size: usize,
        group_count: usize,
        slot: usize,
        lane_data_size: usize,
    ) -> Self {
        let column_count = groups_in_row * group_size;
        let valid_lanes = group_count * group_size;
        let row_count = (group_count + groups_in_row - 1) / groups_in_row;

        let mut view = Self {
            data,
            slot,
            lane_data_size,
            group_size,
            groups_in_row,
            valid_lanes,
            column_count,
            row_count,
            min: 0,
            max: 0,
        };
        let mut values = (0..valid_lanes).filter_map(|lane| view.lane_value(lane));
        if let Some(first) = values.next() {
            let (min, max) = values.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v)));
            view.min = min;
            view.max = max;
        }
        view
    }

    fn lane_value(&self, lane: usize) -> Option<u32> {
        if lane >= self.valid_lanes {
            return None;
        }
        read_dword(self.data, lane * self.lane_data_size + self.slot)
    }

    fn lane_at(&self, row: usize, column: usize) -> Option<usize> {
        if column >= self.column_count {
            return None;
        }
        Some(row * self.column_count + column)
    }

    pub fn column_count(&self) -> usize {
        self.column_count
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Index of the first group in `row`
    pub fn row_header(&self, row: usize) -> usize {
        row * self.groups_in_row
    }

    pub fn group_num(&self, row: usize, column: usize) -> usize {
        self.groups_in_row * row + column / self.group_size
    }

    /// Cells past the last group in the file (the tail of the final row)
    pub fn is_inactive_cell(&self, row: usize, column: usize) -> bool {
        self.get(row, column).is_none()
    }

    pub fn get(&self, row: usize, column: usize) -> Option<u32> {
        self.lane_at(row, column).and_then(|lane| self.lane_value(lane))
    }

    /// Value scaled into `0.0..=1.0` between the slice's min and max
    pub fn relative_value(&self, row: usize, column: usize) -> Option<f32> {
        let value = self.get(row, column)?;
        if self.max == self.min {
            return Some(0.0);
        }
        Some((f64::from(value - self.min) / f64::from(self.max - self.min)) as f32)
    }
}

fn read_dword(data: &[u8], dword_index: usize) -> Option<u32> {
    let start = dword_index.checked_mul(4)?;
    let bytes = data.get(start..start.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Debug output buffer with per-wavefront fetch tracking
#[derive(Debug, Clone)]
pub struct BreakStateData {
    watches: Vec<String>,
    output_file: BreakStateOutputFile,
    /// Dwords per lane: the system slot plus one per watch
    lane_data_size: usize,
    data: Vec<u8>,
    fetched: FetchBitmap,
    local_data: bool,
    group_index: usize,
    group_size: usize,
}

impl BreakStateData {
    /// Creates an empty buffer for a remote output file; data arrives through
    /// [`change_group_with_warnings`](Self::change_group_with_warnings).
    pub fn new(watches: Vec<String>, output_file: BreakStateOutputFile) -> Self {
        let lane_data_size = 1 + watches.len();
        let chunk_dwords = WAVE_SIZE * lane_data_size;
        let chunks = (output_file.dword_count + chunk_dwords - 1) / chunk_dwords;
        Self {
            watches,
            data: vec![0; output_file.dword_count * 4],
            output_file,
            lane_data_size,
            fetched: FetchBitmap::new(chunks),
            local_data: false,
            group_index: 0,
            group_size: 0,
        }
    }

    /// Creates a fully populated buffer from output read on this machine.
    /// `bytes` must already have the file header stripped.
    pub fn from_local(watches: Vec<String>, output_file: BreakStateOutputFile, bytes: &[u8]) -> Self {
        let mut state = Self::new(watches, output_file);
        let n = bytes.len().min(state.data.len());
        state.data[..n].copy_from_slice(&bytes[..n]);
        state.fetched.set_all();
        state.local_data = true;
        state
    }

    pub fn watches(&self) -> &[String] {
        &self.watches
    }

    pub fn output_file(&self) -> &BreakStateOutputFile {
        &self.output_file
    }

    pub fn lane_data_size(&self) -> usize {
        self.lane_data_size
    }

    pub fn group_index(&self) -> usize {
        self.group_index
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn fetched_chunks(&self) -> &FetchBitmap {
        &self.fetched
    }

    fn chunk_bytes(&self) -> usize {
        WAVE_SIZE * self.lane_data_size * 4
    }

    /// Byte range of group `group_index`, not clamped to the file size
    pub fn group_byte_range(&self, group_index: usize, group_size: usize) -> Range<usize> {
        let group_bytes = group_size * self.lane_data_size * 4;
        let start = group_index.saturating_mul(group_bytes);
        start..start.saturating_add(group_bytes)
    }

    /// Number of complete groups of `group_size` lanes in the buffer
    pub fn group_count(&self, group_size: usize) -> usize {
        if group_size == 0 {
            return 0;
        }
        self.output_file.dword_count / (group_size * self.lane_data_size)
    }

    /// True only when every wavefront chunk overlapping the range is populated.
    pub fn is_group_fetched(&self, byte_offset: usize, byte_count: usize) -> bool {
        let end = byte_offset.saturating_add(byte_count).min(self.data.len());
        if byte_offset >= end {
            return true;
        }
        let chunk = self.chunk_bytes();
        self.fetched.all_set(byte_offset / chunk..(end + chunk - 1) / chunk)
    }

    /// Copies fetched bytes into the buffer at `byte_offset` and marks the
    /// chunks the write fully covers. The final chunk of the file counts as
    /// covered when the write reaches the end of the buffer.
    pub fn set_group_data(&mut self, byte_offset: usize, bytes: &[u8]) {
        let Some(dest) = self.data.get_mut(byte_offset..) else {
            return;
        };
        let n = bytes.len().min(dest.len());
        dest[..n].copy_from_slice(&bytes[..n]);

        let end = byte_offset + n;
        let chunk = self.chunk_bytes();
        let first = (byte_offset + chunk - 1) / chunk;
        let last = if end == self.data.len() { (end + chunk - 1) / chunk } else { end / chunk };
        if first < last {
            self.fetched.set_range(first..last);
        }
    }

    /// Selects a group, fetching its data from the server unless it is
    /// already cached.
    ///
    /// Returns an advisory warning when the output file could not be read,
    /// changed since the run, or holds less data than the group spans. The
    /// group selection is updated in every case.
    ///
    /// # Panics
    ///
    /// Panics if `group_size` is zero or not a multiple of [`WAVE_SIZE`].
    pub async fn change_group_with_warnings(
        &mut self,
        channel: &dyn Channel,
        group_index: usize,
        group_size: usize,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        assert!(
            group_size != 0 && group_size % WAVE_SIZE == 0,
            "group size {} is not a multiple of the wavefront size {}",
            group_size,
            WAVE_SIZE
        );
        self.group_index = group_index;
        self.group_size = group_size;

        let range = self.group_byte_range(group_index, group_size);
        if range.start >= self.data.len() {
            return Ok(Some(format!(
                "Group #{} is out of range: the output file contains {} groups.",
                group_index,
                self.group_count(group_size)
            )));
        }
        if self.local_data || self.is_group_fetched(range.start, range.len()) {
            log::trace!("Group #{} served from cache", group_index);
            return Ok(None);
        }

        let byte_count = range.end.min(self.data.len()) - range.start;
        let warning = self.fetch_range(channel, range.start, byte_count, cancel).await?;
        Ok(warning.map(|w| match w {
            FetchWarning::Incomplete { expected, received } => format!(
                "Group #{} is incomplete: expected to read {} bytes but the output file contains {}.",
                group_index, expected, received
            ),
            other => other.to_string(),
        }))
    }

    /// Fetches every chunk not yet in the buffer with a single range request.
    pub async fn fetch_all_groups_with_warnings(
        &mut self,
        channel: &dyn Channel,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        if self.local_data {
            return Ok(None);
        }
        let (Some(first), Some(last)) = (self.fetched.first_unset(), self.fetched.last_unset()) else {
            return Ok(None);
        };
        let chunk = self.chunk_bytes();
        let start = first * chunk;
        let end = ((last + 1) * chunk).min(self.data.len());

        let warning = self.fetch_range(channel, start, end - start, cancel).await?;
        Ok(warning.map(|w| w.to_string()))
    }

    async fn fetch_range(
        &mut self,
        channel: &dyn Channel,
        byte_offset: usize,
        byte_count: usize,
        cancel: &CancellationToken,
    ) -> Result<Option<FetchWarning>> {
        log::debug!(
            "Fetching {} bytes at offset {} of {}",
            byte_count,
            byte_offset,
            self.output_file.path
        );
        let response = channel
            .fetch_result_range(
                FetchResultRange {
                    file_path: self.output_file.path.clone(),
                    binary_output: self.output_file.binary_output,
                    byte_offset: clamp_u32(byte_offset),
                    byte_count: clamp_u32(byte_count),
                    output_offset: self.output_file.offset,
                },
                cancel,
            )
            .await?;

        if response.status != FetchStatus::Successful {
            return Ok(Some(FetchWarning::NotOpened));
        }
        self.set_group_data(byte_offset, &response.data);

        if response.timestamp != self.output_file.timestamp {
            return Ok(Some(FetchWarning::Stale));
        }
        if response.data.len() < byte_count {
            return Ok(Some(FetchWarning::Incomplete {
                expected: byte_count,
                received: response.data.len(),
            }));
        }
        Ok(None)
    }

    /// System values of the selected group; `None` until a group is selected
    pub fn get_system(&self) -> Option<WatchView<'_>> {
        self.view_for_slot(0)
    }

    /// Values of `watch` in the selected group; `None` for an unknown watch
    pub fn get_watch(&self, watch: &str) -> Option<WatchView<'_>> {
        let index = self.watches.iter().position(|w| w == watch)?;
        self.view_for_slot(index + 1)
    }

    fn view_for_slot(&self, slot: usize) -> Option<WatchView<'_>> {
        if self.group_size == 0 {
            return None;
        }
        Some(WatchView::new(&self.data, self.group_index, self.group_size, slot, self.lane_data_size))
    }

    /// Matrix view of `watch` (or [`SYSTEM_WATCH`]) over every group.
    /// Only fetched groups hold meaningful values; see
    /// [`fetch_all_groups_with_warnings`](Self::fetch_all_groups_with_warnings).
    pub fn get_slice_watch(&self, watch: &str, groups_in_row: usize) -> Option<SliceWatchView<'_>> {
        if self.group_size == 0 || groups_in_row == 0 {
            return None;
        }
        let slot = if watch == SYSTEM_WATCH {
            0
        } else {
            self.watches.iter().position(|w| w == watch)? + 1
        };
        Some(SliceWatchView::new(
            &self.data,
            groups_in_row,
            self.group_size,
            self.group_count(self.group_size),
            slot,
            self.lane_data_size,
        ))
    }
}

enum FetchWarning {
    NotOpened,
    Stale,
    Incomplete { expected: usize, received: usize },
}

impl fmt::Display for FetchWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchWarning::NotOpened => write!(f, "Output file could not be opened."),
            FetchWarning::Stale => write!(f, "Output file has changed since the last debugger execution."),
            FetchWarning::Incomplete { expected, received } => write!(
                f,
                "Output file is incomplete: expected to read {} bytes but the output file contains {}.",
                expected, received
            ),
        }
    }
}

fn clamp_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Everything a debug break produced: the output data and the dispatch geometry
pub struct BreakState {
    pub data: BreakStateData,
    pub dispatch_params: Option<BreakStateDispatchParameters>,
}

impl BreakState {
    pub fn new(data: BreakStateData, dispatch_params: Option<BreakStateDispatchParameters>) -> Self {
        Self { data, dispatch_params }
    }
}

impl fmt::Debug for BreakState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakState")
            .field("watches", &self.data.watches)
            .field("output_file", &self.data.output_file.path)
            .field("dword_count", &self.data.output_file.dword_count)
            .field("dispatch_params", &self.dispatch_params)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::dwords_to_bytes;

    fn output_file(dword_count: usize) -> BreakStateOutputFile {
        BreakStateOutputFile {
            path: "/tmp/out.bin".into(),
            binary_output: true,
            offset: 0,
            timestamp: Timestamp(1000),
            dword_count,
        }
    }

    /// Two watches, lane records of three dwords, `groups` groups of 64 lanes.
    /// Dword value encodes (lane, slot) as lane * 10 + slot.
    fn local_state(groups: usize) -> BreakStateData {
        let watches = vec!["a".to_string(), "tid".to_string()];
        let lanes = groups * WAVE_SIZE;
        let values: Vec<u32> = (0..lanes * 3).map(|i| ((i / 3) * 10 + i % 3) as u32).collect();
        BreakStateData::from_local(watches, output_file(values.len()), &dwords_to_bytes(&values))
    }

    #[test]
    fn test_bitmap() {
        let mut bitmap = FetchBitmap::new(130);
        assert_eq!(bitmap.first_unset(), Some(0));
        bitmap.set_range(0..65);
        assert!(bitmap.all_set(0..65));
        assert!(!bitmap.all_set(64..66));
        assert!(bitmap.all_set(10..10));
        bitmap.set(500);
        assert!(!bitmap.get(500));
        assert_eq!(bitmap.first_unset(), Some(65));
        assert_eq!(bitmap.last_unset(), Some(129));
    }

    #[test]
    fn test_partial_overlap_is_not_fetched() {
        let mut state = BreakStateData::new(vec!["a".into()], output_file(4 * WAVE_SIZE * 2));
        let chunk = WAVE_SIZE * 2 * 4;
        // Covers chunk 1 entirely, plus half of chunk 0 and half of chunk 2
        state.set_group_data(chunk / 2, &vec![7u8; chunk * 2]);
        assert!(state.fetched_chunks().get(1));
        assert!(!state.fetched_chunks().get(0));
        assert!(!state.fetched_chunks().get(2));

        assert!(state.is_group_fetched(chunk, chunk));
        assert!(state.is_group_fetched(chunk + 4, chunk - 8));
        assert!(!state.is_group_fetched(chunk / 2, chunk));
        assert!(!state.is_group_fetched(chunk + 4, chunk));
        assert!(state.is_group_fetched(0, 0));
    }

    #[test]
    fn test_tail_chunk_marked_at_end_of_buffer() {
        // 100 lanes of one dword: chunk 0 is full, chunk 1 holds 36 lanes
        let mut state = BreakStateData::new(Vec::new(), output_file(100));
        state.set_group_data(WAVE_SIZE * 4, &[1u8; 36 * 4]);
        assert!(state.fetched_chunks().get(1));
        assert!(!state.fetched_chunks().get(0));
    }

    #[test]
    fn test_set_group_data_then_watch_view_round_trip() {
        let watches = vec!["a".to_string()];
        let mut state = BreakStateData::new(watches, output_file(2 * WAVE_SIZE * 2));
        let values: Vec<u32> = (0..(WAVE_SIZE * 2) as u32).map(|v| v * 3 + 1).collect();
        let range = state.group_byte_range(1, WAVE_SIZE);
        state.set_group_data(range.start, &dwords_to_bytes(&values));
        state.group_index = 1;
        state.group_size = WAVE_SIZE;

        let system = state.get_system().unwrap();
        let a = state.get_watch("a").unwrap();
        assert_eq!(system.len(), WAVE_SIZE);
        for lane in 0..WAVE_SIZE {
            assert_eq!(system.get(lane), Some(values[lane * 2]));
            assert_eq!(a.get(lane), Some(values[lane * 2 + 1]));
        }
        assert_eq!(a.get(WAVE_SIZE), None);
        assert!(state.get_watch("missing").is_none());
    }

    #[test]
    fn test_views_over_local_data() {
        let mut state = local_state(3);
        assert_eq!(state.group_count(64), 3);
        assert_eq!(state.group_count(128), 1);
        assert!(state.get_system().is_none());

        state.group_index = 2;
        state.group_size = 64;
        let tid = state.get_watch("tid").unwrap();
        assert_eq!(tid.get(0), Some(128 * 10 + 2));
        assert_eq!(tid.iter().count(), 64);
    }

    #[test]
    fn test_huge_group_index_yields_empty_views() {
        let mut state = local_state(1);
        state.group_index = usize::MAX;
        state.group_size = 64;
        let tid = state.get_watch("tid").unwrap();
        assert!(tid.is_empty());
        assert_eq!(tid.get(0), None);
        assert_eq!(state.get_system().unwrap().iter().count(), 0);
    }

    #[test]
    fn test_last_group_cut_short() {
        let watches = vec!["a".to_string()];
        // One and a half groups of 64 lanes
        let mut state = BreakStateData::from_local(watches, output_file(96 * 2), &[0u8; 96 * 2 * 4]);
        state.group_index = 1;
        state.group_size = 64;
        assert_eq!(state.get_system().unwrap().len(), 32);
    }

    #[test]
    fn test_slice_view() {
        let mut state = local_state(3);
        state.group_size = 64;
        let slice = state.get_slice_watch("a", 2).unwrap();
        assert_eq!(slice.column_count(), 128);
        assert_eq!(slice.row_count(), 2);
        assert_eq!(slice.min(), 1);
        assert_eq!(slice.max(), 191 * 10 + 1);

        assert_eq!(slice.get(1, 0), Some(128 * 10 + 1));
        assert_eq!(slice.group_num(1, 70), 3);
        assert_eq!(slice.row_header(1), 2);
        assert!(slice.is_inactive_cell(1, 64));
        assert!(!slice.is_inactive_cell(1, 63));
        assert_eq!(slice.relative_value(0, 0), Some(0.0));
        assert_eq!(slice.relative_value(1, 63), Some(1.0));

        assert!(state.get_slice_watch(SYSTEM_WATCH, 2).is_some());
        assert!(state.get_slice_watch("nope", 2).is_none());
    }

    #[tokio::test]
    #[should_panic(expected = "not a multiple of the wavefront size")]
    async fn test_unaligned_group_size_panics() {
        struct Unreachable;
        #[async_trait::async_trait]
        impl Channel for Unreachable {
            fn connection_options(&self) -> crate::communication::ServerConnectionOptions {
                unreachable!()
            }
            fn connection_state(&self) -> crate::types::ClientState {
                unreachable!()
            }
            async fn send_with_reply(
                &self,
                _command: crate::types::Command,
                _cancel: &CancellationToken,
            ) -> Result<crate::types::Response> {
                unreachable!()
            }
            fn force_disconnect(&self) {}
        }

        let mut state = BreakStateData::new(Vec::new(), output_file(256));
        let _ = state
            .change_group_with_warnings(&Unreachable, 0, 100, &CancellationToken::new())
            .await;
    }
}
