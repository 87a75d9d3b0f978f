//! # Clinical Records
//!
//! Typed rows for the two source tables: patients (demographics) and
//! encounters (one row per visit event). Everything downstream works on these
//! already-parsed values; string handling stops at the loader.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use std::fmt;
use std::str::FromStr;

/// Encounter class as recorded by the source system.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EncounterClass {
    Inpatient,
    Outpatient,
    Emergency,
    Ambulatory,
    Wellness,
    Urgentcare,
    /// Any label not covered above, kept verbatim.
    Other(String),
}

impl EncounterClass {
    pub fn is_inpatient(&self) -> bool {
        matches!(self, EncounterClass::Inpatient)
    }
}

impl FromStr for EncounterClass {
    type Err = std::convert::Infallible;

    fn from_str(label: &str) -> Result<Self, Self::Err> {
        Ok(match label.trim().to_ascii_lowercase().as_str() {
            "inpatient" => EncounterClass::Inpatient,
            "outpatient" => EncounterClass::Outpatient,
            "emergency" => EncounterClass::Emergency,
            "ambulatory" => EncounterClass::Ambulatory,
            "wellness" => EncounterClass::Wellness,
            "urgentcare" => EncounterClass::Urgentcare,
            _ => EncounterClass::Other(label.trim().to_string()),
        })
    }
}

impl fmt::Display for EncounterClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EncounterClass::Inpatient => "inpatient",
            EncounterClass::Outpatient => "outpatient",
            EncounterClass::Emergency => "emergency",
            EncounterClass::Ambulatory => "ambulatory",
            EncounterClass::Wellness => "wellness",
            EncounterClass::Urgentcare => "urgentcare",
            EncounterClass::Other(label) => label.as_str(),
        };
        f.write_str(label)
    }
}

/// One row of the patients table.
#[derive(Debug, Clone, PartialEq)]
pub struct Patient {
    pub id: String,
    pub birth_date: NaiveDate,
    pub death_date: Option<NaiveDate>,
    pub gender: String,
    pub race: String,
}

impl Patient {
    /// Time between birth and death, `None` for living patients.
    pub fn lifespan(&self) -> Option<Duration> {
        self.death_date.map(|death| death - self.birth_date)
    }
}

/// One row of the encounters table. `stop >= start` is enforced by the loader.
#[derive(Debug, Clone, PartialEq)]
pub struct Encounter {
    pub patient_id: String,
    pub class: EncounterClass,
    /// SNOMED code describing the encounter itself.
    pub procedure_code: u64,
    /// SNOMED code of the reason for the encounter, if any.
    pub reason_code: Option<u64>,
    pub organization_id: String,
    pub provider_id: String,
    pub start: NaiveDateTime,
    pub stop: NaiveDateTime,
}

impl Encounter {
    pub fn has_reason(&self, code: u64) -> bool {
        self.reason_code == Some(code)
    }
}

/// Both source tables, held together.
#[derive(Debug, Clone, Default)]
pub struct ClinicalRecords {
    pub patients: Vec<Patient>,
    pub encounters: Vec<Encounter>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_labels_parse_case_insensitively() {
        assert_eq!(
            "Inpatient".parse::<EncounterClass>().unwrap(),
            EncounterClass::Inpatient
        );
        assert_eq!(
            "home".parse::<EncounterClass>().unwrap(),
            EncounterClass::Other("home".to_string())
        );
        assert_eq!(EncounterClass::Urgentcare.to_string(), "urgentcare");
    }

    #[test]
    fn lifespan_only_for_deceased() {
        let mut patient = Patient {
            id: "p1".to_string(),
            birth_date: NaiveDate::from_ymd_opt(1950, 1, 1).unwrap(),
            death_date: None,
            gender: "F".to_string(),
            race: "white".to_string(),
        };
        assert!(patient.lifespan().is_none());
        patient.death_date = NaiveDate::from_ymd_opt(1950, 1, 11);
        assert_eq!(patient.lifespan(), Some(Duration::days(10)));
    }
}
