//! GPU timestamp queries.
//!
//! Each frame slot owns one query pool holding a begin/end pair per
//! [`GpuTimer`]. The pairs of one submission queue are contiguous, so they
//! are read back with a single request right after that queue is submitted.

use crate::backend::{
    BackendResult, CommandList, GraphicsBackend, PipelineStages, QueryPoolHandle, SubmitQueue,
};

/// A timed section of the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuTimer {
    DepthPass = 0,
    Clustering = 1,
    LightGrids = 2,
    GridOffsets = 3,
    LightList = 4,
    Onscreen = 5,
    Transfer = 6,
}

impl GpuTimer {
    pub const COUNT: usize = 7;
    pub const ALL: [GpuTimer; Self::COUNT] = [
        GpuTimer::DepthPass,
        GpuTimer::Clustering,
        GpuTimer::LightGrids,
        GpuTimer::GridOffsets,
        GpuTimer::LightList,
        GpuTimer::Onscreen,
        GpuTimer::Transfer,
    ];

    pub fn name(self) -> &'static str {
        match self {
            GpuTimer::DepthPass => "depth_pass",
            GpuTimer::Clustering => "clustering",
            GpuTimer::LightGrids => "calc_light_grids",
            GpuTimer::GridOffsets => "calc_grid_offsets",
            GpuTimer::LightList => "calc_light_list",
            GpuTimer::Onscreen => "onscreen",
            GpuTimer::Transfer => "transfer",
        }
    }

    pub fn begin_query(self) -> u32 {
        self as u32 * 2
    }

    pub fn end_query(self) -> u32 {
        self.begin_query() + 1
    }

    /// Queue whose submission writes this timer.
    pub fn queue(self) -> SubmitQueue {
        match self {
            GpuTimer::DepthPass | GpuTimer::Clustering => SubmitQueue::EarlyGraphics,
            GpuTimer::LightGrids | GpuTimer::GridOffsets | GpuTimer::LightList => SubmitQueue::Compute,
            GpuTimer::Onscreen | GpuTimer::Transfer => SubmitQueue::Graphics,
        }
    }

    /// `(first query, query count)` written by `queue`.
    pub fn queue_range(queue: SubmitQueue) -> (u32, u32) {
        Self::queue_range_of(queue, &Self::ALL)
    }

    /// Like [`queue_range`](Self::queue_range), counting only `timers`.
    pub fn queue_range_of(queue: SubmitQueue, timers: &[GpuTimer]) -> (u32, u32) {
        let mut queries = timers
            .iter()
            .filter(|t| t.queue() == queue)
            .flat_map(|t| [t.begin_query(), t.end_query()]);
        let Some(first) = queries.next() else {
            return (0, 0);
        };
        let (min, max) = queries.fold((first, first), |(lo, hi), q| (lo.min(q), hi.max(q)));
        (min, max - min + 1)
    }
}

/// Queries per pool
pub const QUERY_COUNT: u32 = GpuTimer::COUNT as u32 * 2;

/// Raw timestamps read back for one frame slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryData {
    pub frame_number: u64,
    pub timestamps: [Option<u64>; QUERY_COUNT as usize],
}

impl QueryData {
    /// Elapsed ticks between a timer's begin and end.
    pub fn ticks(&self, timer: GpuTimer) -> Option<u64> {
        let begin = self.timestamps[timer.begin_query() as usize]?;
        let end = self.timestamps[timer.end_query() as usize]?;
        Some(end.saturating_sub(begin))
    }
}

/// Timer durations of one completed frame, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameTimings {
    pub frame_number: u64,
    pub entries: Vec<(GpuTimer, f64)>,
}

impl FrameTimings {
    pub fn from_query_data(data: &QueryData, timestamp_period_ns: f32) -> Self {
        let entries = GpuTimer::ALL
            .iter()
            .filter_map(|&timer| {
                data.ticks(timer)
                    .map(|ticks| (timer, ticks as f64 * timestamp_period_ns as f64 / 1_000_000.0))
            })
            .collect();
        Self {
            frame_number: data.frame_number,
            entries,
        }
    }

    pub fn get(&self, timer: GpuTimer) -> Option<f64> {
        self.entries.iter().find(|(t, _)| *t == timer).map(|(_, ms)| *ms)
    }

    pub fn total_ms(&self) -> f64 {
        self.entries.iter().map(|(_, ms)| ms).sum()
    }
}

/// One query pool and its read-back data per frame slot.
#[derive(Debug)]
pub struct QueryPools {
    pools: Vec<QueryPoolHandle>,
    /// Timers some pass records
    timers: Vec<GpuTimer>,
    data: Vec<QueryData>,
    last_completed: Option<usize>,
}

impl QueryPools {
    pub fn new<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        slot_count: usize,
        timers: &[GpuTimer],
    ) -> BackendResult<Self> {
        let pools = (0..slot_count)
            .map(|_| backend.create_query_pool(QUERY_COUNT))
            .collect::<BackendResult<Vec<_>>>()?;
        Ok(Self {
            pools,
            timers: timers.to_vec(),
            data: vec![QueryData::default(); slot_count],
            last_completed: None,
        })
    }

    pub fn pool(&self, slot: usize) -> QueryPoolHandle {
        self.pools[slot % self.pools.len()]
    }

    pub fn pools(&self) -> &[QueryPoolHandle] {
        &self.pools
    }

    /// Reset a timer's pair and write its begin timestamp.
    pub fn record_begin(commands: &mut CommandList, pool: QueryPoolHandle, timer: GpuTimer) {
        commands.reset_queries(pool, timer.begin_query(), 2);
        commands.write_timestamp(PipelineStages::TOP_OF_PIPE, pool, timer.begin_query());
    }

    pub fn record_end(commands: &mut CommandList, pool: QueryPoolHandle, timer: GpuTimer, stage: PipelineStages) {
        commands.write_timestamp(stage, pool, timer.end_query());
    }

    /// Read the queries `queue` wrote into `slot`, waiting for them.
    pub fn read<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        slot: usize,
        queue: SubmitQueue,
        frame_number: u64,
    ) -> BackendResult<()> {
        let (first, count) = GpuTimer::queue_range_of(queue, &self.timers);
        if count == 0 {
            return Ok(());
        }
        let pool = self.pool(slot);
        let data = &mut self.data[slot % self.pools.len()];
        if data.frame_number != frame_number {
            *data = QueryData {
                frame_number,
                ..Default::default()
            };
        }
        match backend.get_query_results(pool, first, count, true)? {
            Some(values) => {
                for (i, value) in values.into_iter().enumerate() {
                    data.timestamps[first as usize + i] = Some(value);
                }
            }
            None => log::debug!("Timestamps of {} queue not available", queue.name()),
        }
        Ok(())
    }

    /// Mark the slot's frame as fully submitted and read.
    pub fn complete(&mut self, slot: usize) {
        self.last_completed = Some(slot % self.pools.len());
    }

    pub fn data(&self, slot: usize) -> &QueryData {
        &self.data[slot % self.data.len()]
    }

    pub fn last_completed(&self) -> Option<&QueryData> {
        self.last_completed.map(|slot| &self.data[slot])
    }
}
