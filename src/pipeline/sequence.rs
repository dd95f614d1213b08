//! Ordered stage sequences and range selection.

use super::stage::{Locus, StageDescriptor};
use crate::config::Config;
use crate::error::{Error, Result};
use std::collections::HashSet;

/// Ordered, uniquely named stages of one model.
#[derive(Debug, Clone, Default)]
pub struct StagePipeline {
    stages: Vec<StageDescriptor>,
}

impl StagePipeline {
    /// Build a pipeline; ordinals follow the given order.
    pub fn new(stages: Vec<StageDescriptor>) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut stages = stages;
        for (ordinal, stage) in stages.iter_mut().enumerate() {
            if !seen.insert(stage.name().to_string()) {
                return Err(Error::DuplicateStage(stage.name().to_string()));
            }
            stage.set_ordinal(ordinal);
        }
        Ok(Self { stages })
    }

    /// The stage sequence of the model selected by `config`.
    pub fn for_config(config: &Config) -> Result<Self> {
        Self::new(config.model_variant().create_stages())
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(StageDescriptor::name).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&StageDescriptor> {
        self.stages.iter().find(|s| s.name() == name)
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.stages
            .iter()
            .position(|s| s.name() == name)
            .ok_or_else(|| Error::UnknownStage {
                name: name.to_string(),
                available: self.names().iter().map(|s| s.to_string()).collect(),
            })
    }

    /// Contiguous run of stages from `start_from` through `stop_after`.
    ///
    /// Either bound may be omitted to mean the first or last stage.
    pub fn slice(&self, start_from: Option<&str>, stop_after: Option<&str>) -> Result<&[StageDescriptor]> {
        let first = start_from.map(|n| self.position(n)).transpose()?.unwrap_or(0);
        let last = match stop_after {
            Some(name) => self.position(name)?,
            None if self.stages.is_empty() => return Ok(&[]),
            None => self.stages.len() - 1,
        };

        if first > last {
            return Err(Error::EmptyRange {
                start_from: self.stages[first].name().to_string(),
                stop_after: self.stages[last].name().to_string(),
            });
        }
        Ok(&self.stages[first..=last])
    }
}

/// Split of a stage selection around one batch job.
#[derive(Debug, Default)]
pub struct SubmitPartition<'a> {
    /// Control stages before the first job stage
    pub pre_job: Vec<&'a StageDescriptor>,
    /// First through last job stage; control stages in between are moved to `pre_job`
    pub job: Vec<&'a StageDescriptor>,
    /// Control stages after the last job stage
    pub post_job: Vec<&'a StageDescriptor>,
}

impl<'a> SubmitPartition<'a> {
    pub fn new(stages: &[&'a StageDescriptor]) -> Self {
        let first_job = stages.iter().position(|s| s.locus() == Locus::Job);
        let last_job = stages.iter().rposition(|s| s.locus() == Locus::Job);

        let (Some(first), Some(last)) = (first_job, last_job) else {
            return Self {
                pre_job: stages.to_vec(),
                ..Self::default()
            };
        };

        let mut partition = Self {
            pre_job: stages[..first].to_vec(),
            ..Self::default()
        };
        for stage in &stages[first..=last] {
            match stage.locus() {
                Locus::Job => partition.job.push(stage),
                Locus::Control => partition.pre_job.push(stage),
            }
        }
        partition.post_job = stages[last + 1..].to_vec();
        partition
    }

    pub fn has_job(&self) -> bool {
        !self.job.is_empty()
    }
}
