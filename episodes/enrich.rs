//! Left-joins hospitalization episodes with patient demographics and derives
//! age at admission and length of stay.

use crate::records::Patient;
use crate::segment::HospitalizationEpisode;
use ahash::AHashMap;
use chrono::{Duration, NaiveDate};
use polars::prelude::*;

const DAYS_PER_YEAR: f64 = 365.25;
const SECONDS_PER_DAY: f64 = 86_400.0;

/// A hospitalization episode with the patient's demographics attached.
/// Demographic fields are `None` when the patient identifier has no match.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedEpisode {
    pub episode: HospitalizationEpisode,
    pub birth_date: Option<NaiveDate>,
    pub gender: Option<String>,
    pub race: Option<String>,
    /// Episode start minus birth date.
    pub age: Option<Duration>,
    pub duration: Duration,
}

impl EnrichedEpisode {
    pub fn age_years(&self) -> Option<f64> {
        self.age.map(|age| fractional_days(age) / DAYS_PER_YEAR)
    }

    pub fn duration_days(&self) -> f64 {
        fractional_days(self.duration)
    }
}

fn fractional_days(span: Duration) -> f64 {
    span.num_seconds() as f64 / SECONDS_PER_DAY
}

/// The enriched episode table, one row per episode.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EpisodeTable {
    pub rows: Vec<EnrichedEpisode>,
}

impl EpisodeTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column view for modeling and export. `age` is in years and `duration`
    /// in days; timestamps are ISO-8601 strings.
    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        let rows = &self.rows;
        let text = |f: fn(&EnrichedEpisode) -> String| -> Vec<String> { rows.iter().map(f).collect() };
        let optional_text = |f: fn(&EnrichedEpisode) -> Option<String>| -> Vec<Option<String>> {
            rows.iter().map(f).collect()
        };

        DataFrame::new(vec![
            Column::new("patient".into(), text(|r| r.episode.patient_id.clone())),
            Column::new(
                "startdate".into(),
                text(|r| r.episode.start.format("%Y-%m-%dT%H:%M:%S").to_string()),
            ),
            Column::new(
                "stopdate".into(),
                text(|r| r.episode.stop.format("%Y-%m-%dT%H:%M:%S").to_string()),
            ),
            Column::new(
                "is_covid_hospitalization".into(),
                rows.iter()
                    .map(|r| r.episode.is_covid_hospitalization)
                    .collect::<Vec<bool>>(),
            ),
            Column::new(
                "is_covid_death".into(),
                rows.iter()
                    .map(|r| r.episode.is_covid_death)
                    .collect::<Vec<bool>>(),
            ),
            Column::new(
                "n_organizations".into(),
                rows.iter()
                    .map(|r| r.episode.n_organizations as u32)
                    .collect::<Vec<u32>>(),
            ),
            Column::new(
                "leading_organization".into(),
                text(|r| r.episode.leading_organization.clone()),
            ),
            Column::new(
                "n_providers".into(),
                rows.iter()
                    .map(|r| r.episode.n_providers as u32)
                    .collect::<Vec<u32>>(),
            ),
            Column::new(
                "leading_provider".into(),
                text(|r| r.episode.leading_provider.clone()),
            ),
            Column::new(
                "birthdate".into(),
                optional_text(|r| r.birth_date.map(|d| d.format("%Y-%m-%d").to_string())),
            ),
            Column::new("gender".into(), optional_text(|r| r.gender.clone())),
            Column::new("race".into(), optional_text(|r| r.race.clone())),
            Column::new(
                "age".into(),
                rows.iter().map(|r| r.age_years()).collect::<Vec<Option<f64>>>(),
            ),
            Column::new(
                "duration".into(),
                rows.iter().map(|r| r.duration_days()).collect::<Vec<f64>>(),
            ),
        ])
    }
}

/// Attaches demographics to every episode. Episodes whose patient is unknown
/// are kept with empty demographic fields.
pub fn enrich(episodes: Vec<HospitalizationEpisode>, patients: &[Patient]) -> EpisodeTable {
    let by_id: AHashMap<&str, &Patient> = patients.iter().map(|p| (p.id.as_str(), p)).collect();

    let mut unmatched = 0usize;
    let rows = episodes
        .into_iter()
        .map(|episode| {
            let patient = by_id.get(episode.patient_id.as_str()).copied();
            if patient.is_none() {
                unmatched += 1;
            }
            let birth_date = patient.map(|p| p.birth_date);
            let age = birth_date.and_then(|birth| {
                birth
                    .and_hms_opt(0, 0, 0)
                    .map(|midnight| episode.start - midnight)
            });
            EnrichedEpisode {
                duration: episode.duration(),
                gender: patient.map(|p| p.gender.clone()),
                race: patient.map(|p| p.race.clone()),
                birth_date,
                age,
                episode,
            }
        })
        .collect();

    if unmatched > 0 {
        log::warn!("{unmatched} episodes have no matching patient record; demographics left empty");
    }
    EpisodeTable { rows }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use chrono::NaiveDateTime;

    fn instant(text: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M").unwrap()
    }

    fn episode(patient_id: &str) -> HospitalizationEpisode {
        HospitalizationEpisode {
            patient_id: patient_id.to_string(),
            start: instant("2020-04-01 12:00"),
            stop: instant("2020-04-03 00:00"),
            is_covid_hospitalization: true,
            is_covid_death: false,
            n_organizations: 1,
            leading_organization: "org".to_string(),
            n_providers: 1,
            leading_provider: "doc".to_string(),
        }
    }

    #[test]
    fn unmatched_patients_keep_their_rows() {
        let patients = vec![Patient {
            id: "known".to_string(),
            birth_date: NaiveDate::from_ymd_opt(1970, 4, 1).unwrap(),
            death_date: None,
            gender: "M".to_string(),
            race: "asian".to_string(),
        }];
        let table = enrich(vec![episode("known"), episode("stranger")], &patients);
        assert_eq!(table.len(), 2);

        let known = &table.rows[0];
        assert_eq!(known.gender.as_deref(), Some("M"));
        assert_abs_diff_eq!(known.duration_days(), 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(known.age_years().unwrap(), 50.0, epsilon = 0.01);

        let stranger = &table.rows[1];
        assert!(stranger.gender.is_none());
        assert!(stranger.age.is_none());
        assert_eq!(stranger.duration, Duration::hours(36));
    }

    #[test]
    fn dataframe_has_one_row_per_episode_with_null_demographics() {
        let table = enrich(vec![episode("a"), episode("b")], &[]);
        let df = table.to_dataframe().unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.column("age").unwrap().null_count(), 2);
        assert_eq!(df.column("gender").unwrap().null_count(), 2);
        assert_eq!(df.column("duration").unwrap().null_count(), 0);
    }
}
