//! Process-group information used for logging and workspace placement.

use std::fmt;

pub const RANK_ENV: &str = "RANK";
pub const WORLD_SIZE_ENV: &str = "WORLD_SIZE";

/// View of the distributed runtime the layer runs under.
pub trait Distributed: Send + Sync + fmt::Debug {
    fn is_initialized(&self) -> bool;
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;

    /// Rank reported to the kernel library; 0 outside a distributed run.
    fn effective_rank(&self) -> usize {
        if self.is_initialized() {
            self.rank()
        } else {
            0
        }
    }
}

/// A single process with no distributed runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Distributed for SingleProcess {
    fn is_initialized(&self) -> bool {
        false
    }

    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }
}

/// Rank and world size read from `RANK` / `WORLD_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvDistributed {
    launch: Option<(usize, usize)>,
}

impl EnvDistributed {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Initialized only when both variables are present and parse.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<usize>().ok());
        let launch = match (parse(RANK_ENV), parse(WORLD_SIZE_ENV)) {
            (Some(rank), Some(world)) if world > 0 && rank < world => Some((rank, world)),
            _ => None,
        };
        Self { launch }
    }
}

impl Distributed for EnvDistributed {
    fn is_initialized(&self) -> bool {
        self.launch.is_some()
    }

    fn rank(&self) -> usize {
        self.launch.map(|(rank, _)| rank).unwrap_or(0)
    }

    fn world_size(&self) -> usize {
        self.launch.map(|(_, world)| world).unwrap_or(1)
    }
}

/// Tensor-parallel group handed to sub-module builders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelGroup {
    pub ranks: Vec<usize>,
    pub local_rank: usize,
}

impl ParallelGroup {
    pub fn single() -> Self {
        Self {
            ranks: vec![0],
            local_rank: 0,
        }
    }

    pub fn new(ranks: Vec<usize>, local_rank: usize) -> Self {
        Self { ranks, local_rank }
    }

    pub fn world_size(&self) -> usize {
        self.ranks.len().max(1)
    }

    /// Position of this process within the group.
    pub fn shard_index(&self) -> usize {
        self.ranks
            .iter()
            .position(|&rank| rank == self.local_rank)
            .unwrap_or(0)
    }
}

impl Default for ParallelGroup {
    fn default() -> Self {
        Self::single()
    }
}
