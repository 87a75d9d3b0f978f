//! # Clinical Record Loading
//!
//! Reads the `patients.csv` and `encounters.csv` exports from a data directory
//! and converts them into typed records. The column names follow the Synthea
//! export and are not configurable.
//!
//! - A missing directory or file is a `DataError::MissingSource`, kept distinct
//!   from parse failures so callers can tell a misconfigured run apart from
//!   damaged data.
//! - Parsing happens once here. Nothing downstream touches date strings.

use crate::records::{ClinicalRecords, Encounter, EncounterClass, Patient};
use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::*;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const PATIENTS_FILE: &str = "patients.csv";
pub const ENCOUNTERS_FILE: &str = "encounters.csv";

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Data source '{}' does not exist.", .0.display())]
    MissingSource(PathBuf),
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{column}' was not found in '{file}'. Please check spelling and case."
    )]
    ColumnNotFound { file: &'static str, column: &'static str },
    #[error("Missing value in required column '{column}' at row {row}.")]
    MissingValue { column: &'static str, row: usize },
    #[error("Could not parse '{value}' in column '{column}' at row {row}: expected {expected}.")]
    InvalidValue {
        column: &'static str,
        row: usize,
        value: String,
        expected: &'static str,
    },
    #[error("Encounter at row {row} stops ({stop}) before it starts ({start}).")]
    StopBeforeStart {
        row: usize,
        start: NaiveDateTime,
        stop: NaiveDateTime,
    },
}

/// Loads both tables from `data_dir`.
pub fn load_records(data_dir: &Path) -> Result<ClinicalRecords, DataError> {
    if !data_dir.is_dir() {
        return Err(DataError::MissingSource(data_dir.to_path_buf()));
    }

    let patients = load_patients(&data_dir.join(PATIENTS_FILE))?;
    let encounters = load_encounters(&data_dir.join(ENCOUNTERS_FILE))?;
    log::info!(
        "Loaded {} patients and {} encounters from '{}'",
        patients.len(),
        encounters.len(),
        data_dir.display()
    );

    Ok(ClinicalRecords {
        patients,
        encounters,
    })
}

pub fn load_patients(path: &Path) -> Result<Vec<Patient>, DataError> {
    let df = read_csv(path)?;
    let table = Table::new(&df, PATIENTS_FILE);

    let ids = table.strings("Id")?;
    let births = table.strings("BIRTHDATE")?;
    let deaths = table.strings("DEATHDATE")?;
    let genders = table.strings("GENDER")?;
    let races = table.strings("RACE")?;

    let mut patients = Vec::with_capacity(df.height());
    for row in 0..df.height() {
        let birth = required(&births, "BIRTHDATE", row)?;
        patients.push(Patient {
            id: required(&ids, "Id", row)?.to_string(),
            birth_date: parse_date(birth, "BIRTHDATE", row)?,
            death_date: deaths[row]
                .as_deref()
                .filter(|text| !text.is_empty())
                .map(|text| parse_date(text, "DEATHDATE", row))
                .transpose()?,
            gender: required(&genders, "GENDER", row)?.to_string(),
            race: required(&races, "RACE", row)?.to_string(),
        });
    }
    Ok(patients)
}

pub fn load_encounters(path: &Path) -> Result<Vec<Encounter>, DataError> {
    let df = read_csv(path)?;
    let table = Table::new(&df, ENCOUNTERS_FILE);

    let patients = table.strings("PATIENT")?;
    let classes = table.strings("ENCOUNTERCLASS")?;
    let codes = table.strings("CODE")?;
    let reasons = table.strings("REASONCODE")?;
    let organizations = table.strings("ORGANIZATION")?;
    let providers = table.strings("PROVIDER")?;
    let starts = table.strings("START")?;
    let stops = table.strings("STOP")?;

    let mut encounters = Vec::with_capacity(df.height());
    for row in 0..df.height() {
        let start = parse_timestamp(required(&starts, "START", row)?, "START", row)?;
        let stop = parse_timestamp(required(&stops, "STOP", row)?, "STOP", row)?;
        if stop < start {
            return Err(DataError::StopBeforeStart { row, start, stop });
        }

        let class = match required(&classes, "ENCOUNTERCLASS", row)?.parse::<EncounterClass>() {
            Ok(class) => class,
            Err(never) => match never {},
        };

        encounters.push(Encounter {
            patient_id: required(&patients, "PATIENT", row)?.to_string(),
            class,
            procedure_code: parse_code(required(&codes, "CODE", row)?, "CODE", row)?,
            reason_code: reasons[row]
                .as_deref()
                .filter(|text| !text.is_empty())
                .map(|text| parse_code(text, "REASONCODE", row))
                .transpose()?,
            organization_id: required(&organizations, "ORGANIZATION", row)?.to_string(),
            provider_id: required(&providers, "PROVIDER", row)?.to_string(),
            start,
            stop,
        });
    }
    Ok(encounters)
}

fn read_csv(path: &Path) -> Result<DataFrame, DataError> {
    if !path.is_file() {
        return Err(DataError::MissingSource(path.to_path_buf()));
    }
    let file = File::open(path)?;
    // Everything is read as text; typing is done per column below so that codes
    // and identifiers never go through float inference.
    CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .into_reader_with_file_handle(file)
        .finish()
        .map_err(DataError::from)
}

/// Column access with the source file name attached to errors.
struct Table<'a> {
    df: &'a DataFrame,
    file: &'static str,
}

impl<'a> Table<'a> {
    fn new(df: &'a DataFrame, file: &'static str) -> Self {
        Self { df, file }
    }

    fn strings(&self, column: &'static str) -> Result<Vec<Option<String>>, DataError> {
        let values = self.df.column(column).map_err(|_| DataError::ColumnNotFound {
            file: self.file,
            column,
        })?;
        let casted = values.cast(&DataType::String)?;
        Ok(casted
            .str()?
            .into_iter()
            .map(|value| value.map(str::to_string))
            .collect())
    }
}

fn required<'v>(
    values: &'v [Option<String>],
    column: &'static str,
    row: usize,
) -> Result<&'v str, DataError> {
    match values[row].as_deref() {
        Some(text) if !text.is_empty() => Ok(text),
        _ => Err(DataError::MissingValue { column, row }),
    }
}

fn parse_date(text: &str, column: &'static str, row: usize) -> Result<NaiveDate, DataError> {
    NaiveDate::parse_from_str(text, DATE_FORMAT).map_err(|_| DataError::InvalidValue {
        column,
        row,
        value: text.to_string(),
        expected: "a date formatted as YYYY-MM-DD",
    })
}

fn parse_timestamp(
    text: &str,
    column: &'static str,
    row: usize,
) -> Result<NaiveDateTime, DataError> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT).map_err(|_| DataError::InvalidValue {
        column,
        row,
        value: text.to_string(),
        expected: "a UTC timestamp formatted as YYYY-MM-DDTHH:MM:SSZ",
    })
}

fn parse_code(text: &str, column: &'static str, row: usize) -> Result<u64, DataError> {
    // Some exports write integral codes with a trailing ".0".
    let trimmed = text.trim();
    let trimmed = trimmed.strip_suffix(".0").unwrap_or(trimmed);
    trimmed.parse::<u64>().map_err(|_| DataError::InvalidValue {
        column,
        row,
        value: text.to_string(),
        expected: "a numeric SNOMED code",
    })
}
