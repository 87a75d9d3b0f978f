//! # Episode Segmentation
//!
//! Turns a patient's encounter history into discrete hospitalization episodes.
//!
//! The merge logic is an explicit finite-state accumulator. `Segmenter::step`
//! consumes one encounter and returns the next state together with an episode
//! when the encounter closes the previous one. This keeps the merge and split
//! rules testable without any grouping or sorting around them.
//!
//! Rules, applied to encounters sorted by start instant:
//!
//! 1. Only patients with at least one inpatient encounter whose reason is the
//!    COVID-19 diagnosis are in scope, and only encounters starting strictly
//!    after the cutoff are considered.
//! 2. An encounter contributes when it is inpatient and its code is not on the
//!    non-hospitalization denylist.
//! 3. A contributing encounter extends the open episode when its stop lies
//!    after the current stop but within the tolerance of it. Adjacency is
//!    measured stop-to-stop so that overlapping admission records for the same
//!    stay collapse together. A stop at or before the current stop is absorbed
//!    without moving the boundary. Anything further out closes the episode and
//!    opens a new one seeded by this encounter.
//! 4. A COVID death certificate marks the open episode. With no open episode
//!    the data contradicts the assumption that death follows an admission,
//!    which is reported as `SegmentError::DeathWithoutAdmission`.

use crate::records::Encounter;
use crate::tally::Tally;
use ahash::AHashSet;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// SNOMED code for COVID-19.
pub const COVID_CODE: u64 = 840539006;
/// SNOMED code for a death certification encounter.
pub const DEATH_CERTIFICATE_CODE: u64 = 308646001;
/// Inpatient encounter codes that are not admissions.
pub const NONHOSPITALIZATION_CODES: [u64; 6] = [
    310061009, 56876005, 183495009, 305411003, 67799006, 185389009,
];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SegmentError {
    #[error(
        "Patient '{patient_id}' has a COVID-19 death certificate at {at} but no hospitalization was open. Every COVID-19 death is expected to follow an admission."
    )]
    DeathWithoutAdmission {
        patient_id: String,
        at: NaiveDateTime,
    },
}

/// Constants steering the segmentation. The defaults are the values the
/// pipeline was calibrated with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    pub covid_code: u64,
    pub death_certificate_code: u64,
    pub nonhospitalization_codes: Vec<u64>,
    /// Encounters must start strictly after this instant.
    pub cutoff: NaiveDateTime,
    /// Maximum distance between consecutive stop instants of one stay.
    pub tolerance_hours: i64,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            covid_code: COVID_CODE,
            death_certificate_code: DEATH_CERTIFICATE_CODE,
            nonhospitalization_codes: NONHOSPITALIZATION_CODES.to_vec(),
            cutoff: NaiveDate::from_ymd_opt(2020, 1, 1)
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .unwrap_or_default(),
            tolerance_hours: 24,
        }
    }
}

impl SegmentationConfig {
    /// The merge window, saturating at the bounds `Duration` can represent.
    pub fn tolerance(&self) -> Duration {
        Duration::try_hours(self.tolerance_hours).unwrap_or(if self.tolerance_hours < 0 {
            Duration::MIN
        } else {
            Duration::MAX
        })
    }
}

/// A single hospitalization stay derived from one or more encounters.
#[derive(Debug, Clone, PartialEq)]
pub struct HospitalizationEpisode {
    pub patient_id: String,
    pub start: NaiveDateTime,
    pub stop: NaiveDateTime,
    pub is_covid_hospitalization: bool,
    pub is_covid_death: bool,
    pub n_organizations: usize,
    pub leading_organization: String,
    pub n_providers: usize,
    pub leading_provider: String,
}

impl HospitalizationEpisode {
    pub fn duration(&self) -> Duration {
        self.stop - self.start
    }
}

/// Accumulated state of the episode currently being built.
#[derive(Debug, Clone)]
pub struct OpenEpisode {
    patient_id: String,
    start: NaiveDateTime,
    stop: NaiveDateTime,
    organizations: Tally,
    providers: Tally,
    is_covid_hospitalization: bool,
    is_covid_death: bool,
}

impl OpenEpisode {
    fn seeded(encounter: &Encounter, covid_code: u64) -> Self {
        Self {
            patient_id: encounter.patient_id.clone(),
            start: encounter.start,
            stop: encounter.stop,
            organizations: Tally::seeded(&encounter.organization_id),
            providers: Tally::seeded(&encounter.provider_id),
            is_covid_hospitalization: encounter.has_reason(covid_code),
            is_covid_death: false,
        }
    }

    fn absorb(&mut self, encounter: &Encounter, covid_code: u64) {
        self.organizations.push(&encounter.organization_id);
        self.providers.push(&encounter.provider_id);
        if encounter.has_reason(covid_code) {
            self.is_covid_hospitalization = true;
        }
    }

    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    pub fn stop(&self) -> NaiveDateTime {
        self.stop
    }

    fn close(self) -> HospitalizationEpisode {
        HospitalizationEpisode {
            leading_organization: self.organizations.mode().unwrap_or_default().to_string(),
            leading_provider: self.providers.mode().unwrap_or_default().to_string(),
            n_organizations: self.organizations.distinct(),
            n_providers: self.providers.distinct(),
            patient_id: self.patient_id,
            start: self.start,
            stop: self.stop,
            is_covid_hospitalization: self.is_covid_hospitalization,
            is_covid_death: self.is_covid_death,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub enum SegmenterState {
    #[default]
    Idle,
    Open(OpenEpisode),
}

pub struct Segmenter {
    config: SegmentationConfig,
    denylist: AHashSet<u64>,
}

impl Segmenter {
    pub fn new(config: SegmentationConfig) -> Self {
        let denylist = config.nonhospitalization_codes.iter().copied().collect();
        Self { config, denylist }
    }

    pub fn config(&self) -> &SegmentationConfig {
        &self.config
    }

    /// Inpatient and not a denylisted non-admission code.
    pub fn contributes(&self, encounter: &Encounter) -> bool {
        encounter.class.is_inpatient() && !self.denylist.contains(&encounter.procedure_code)
    }

    fn is_covid_death_certificate(&self, encounter: &Encounter) -> bool {
        encounter.procedure_code == self.config.death_certificate_code
            && encounter.has_reason(self.config.covid_code)
    }

    /// Advances the accumulator by one encounter.
    pub fn step(
        &self,
        state: SegmenterState,
        encounter: &Encounter,
    ) -> Result<(SegmenterState, Option<HospitalizationEpisode>), SegmentError> {
        let covid_code = self.config.covid_code;

        if self.contributes(encounter) {
            return Ok(match state {
                SegmenterState::Idle => (
                    SegmenterState::Open(OpenEpisode::seeded(encounter, covid_code)),
                    None,
                ),
                SegmenterState::Open(mut open) => {
                    if encounter.stop <= open.stop {
                        open.absorb(encounter, covid_code);
                        (SegmenterState::Open(open), None)
                    } else if open
                        .stop
                        .checked_add_signed(self.config.tolerance())
                        .map_or(self.config.tolerance_hours > 0, |limit| {
                            encounter.stop < limit
                        })
                    {
                        open.absorb(encounter, covid_code);
                        open.stop = encounter.stop;
                        (SegmenterState::Open(open), None)
                    } else {
                        let emitted = open.close();
                        (
                            SegmenterState::Open(OpenEpisode::seeded(encounter, covid_code)),
                            Some(emitted),
                        )
                    }
                }
            });
        }

        if self.is_covid_death_certificate(encounter) {
            return match state {
                SegmenterState::Open(mut open) => {
                    open.is_covid_death = true;
                    Ok((SegmenterState::Open(open), None))
                }
                SegmenterState::Idle => Err(SegmentError::DeathWithoutAdmission {
                    patient_id: encounter.patient_id.clone(),
                    at: encounter.start,
                }),
            };
        }

        Ok((state, None))
    }

    /// Emits whatever episode is still open at the end of a stream.
    pub fn finish(&self, state: SegmenterState) -> Option<HospitalizationEpisode> {
        match state {
            SegmenterState::Idle => None,
            SegmenterState::Open(open) => Some(open.close()),
        }
    }

    /// Runs the accumulator over one patient's encounters, which must already
    /// be sorted by start instant and filtered to the cutoff.
    pub fn segment_patient<'a, I>(
        &self,
        encounters: I,
    ) -> Result<Vec<HospitalizationEpisode>, SegmentError>
    where
        I: IntoIterator<Item = &'a Encounter>,
    {
        let mut episodes = Vec::new();
        let mut state = SegmenterState::Idle;
        for encounter in encounters {
            let (next, emitted) = self.step(state, encounter)?;
            episodes.extend(emitted);
            state = next;
        }
        episodes.extend(self.finish(state));
        Ok(episodes)
    }

    /// Segments the full encounter table. Patients are visited in identifier
    /// order; each patient's episodes come out chronologically.
    pub fn segment(
        &self,
        encounters: &[Encounter],
    ) -> Result<Vec<HospitalizationEpisode>, SegmentError> {
        let covid_patients: AHashSet<&str> = encounters
            .iter()
            .filter(|e| e.class.is_inpatient() && e.has_reason(self.config.covid_code))
            .map(|e| e.patient_id.as_str())
            .collect();

        let mut in_scope: Vec<&Encounter> = encounters
            .iter()
            .filter(|e| covid_patients.contains(e.patient_id.as_str()))
            .filter(|e| e.start > self.config.cutoff)
            .collect();
        // Stable, so same-instant encounters keep their table order.
        in_scope.sort_by(|a, b| a.patient_id.cmp(&b.patient_id).then(a.start.cmp(&b.start)));

        log::info!(
            "Segmenting {} encounters from {} COVID-19 inpatients",
            in_scope.len(),
            covid_patients.len()
        );

        let mut episodes = Vec::new();
        for (_, group) in &in_scope.into_iter().chunk_by(|e| e.patient_id.clone()) {
            episodes.extend(self.segment_patient(group)?);
        }

        log::info!("Derived {} hospitalization episodes", episodes.len());
        Ok(episodes)
    }
}
