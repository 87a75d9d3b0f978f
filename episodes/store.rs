use crate::enrich::{EpisodeTable, enrich};
use crate::loader::{DataError, load_records};
use crate::records::{ClinicalRecords, Encounter, Patient};
use crate::segment::{SegmentError, SegmentationConfig, Segmenter};
use std::path::Path;

/// Owns the clinical records of one data source and the episode table derived
/// from them. The table is computed on first request and reused afterwards.
pub struct EpisodeStore {
    records: ClinicalRecords,
    segmenter: Segmenter,
    episodes: Option<EpisodeTable>,
}

impl EpisodeStore {
    /// Loads the records found in `data_dir`.
    pub fn open(data_dir: &Path, config: SegmentationConfig) -> Result<Self, DataError> {
        Ok(Self::from_records(load_records(data_dir)?, config))
    }

    pub fn from_records(records: ClinicalRecords, config: SegmentationConfig) -> Self {
        Self {
            records,
            segmenter: Segmenter::new(config),
            episodes: None,
        }
    }

    pub fn patients(&self) -> &[Patient] {
        &self.records.patients
    }

    pub fn encounters(&self) -> &[Encounter] {
        &self.records.encounters
    }

    pub fn is_computed(&self) -> bool {
        self.episodes.is_some()
    }

    /// The enriched COVID-19 hospitalization table, computing it if necessary.
    pub fn covid_hospitalizations(&mut self) -> Result<&EpisodeTable, SegmentError> {
        let table = match self.episodes.take() {
            Some(table) => table,
            None => {
                let episodes = self.segmenter.segment(&self.records.encounters)?;
                enrich(episodes, &self.records.patients)
            }
        };
        let table: &EpisodeTable = self.episodes.insert(table);
        Ok(table)
    }
}
