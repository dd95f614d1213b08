//! Remote data products: availability windows, object keys and local layout.

use crate::config::{CoastalDomain, MeteoSource};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

const NWM_RETRO_BUCKET: &str = "noaa-nwm-retrospective-3-0-pds";
const NWM_ANA_BUCKET: &str = "noaa-nwm-pds";
const STOFS_BUCKET: &str = "noaa-gestofs-pds";

/// Category of input data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    /// Atmospheric forcing
    Meteo,
    /// Streamflow (channel routing output)
    Hydro,
    /// Open-boundary water levels
    Coastal,
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DataKind::Meteo => "meteo",
            DataKind::Hydro => "hydro",
            DataKind::Coastal => "coastal",
        })
    }
}

/// Remote product providing one or more [`DataKind`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceId {
    NwmRetro,
    NwmAna,
    Stofs,
}

impl SourceId {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceId::NwmRetro => "nwm_retro",
            SourceId::NwmAna => "nwm_ana",
            SourceId::Stofs => "stofs",
        }
    }

    pub fn bucket(self) -> &'static str {
        match self {
            SourceId::NwmRetro => NWM_RETRO_BUCKET,
            SourceId::NwmAna => NWM_ANA_BUCKET,
            SourceId::Stofs => STOFS_BUCKET,
        }
    }
}

impl From<MeteoSource> for SourceId {
    fn from(source: MeteoSource) -> Self {
        match source {
            MeteoSource::NwmRetro => SourceId::NwmRetro,
            MeteoSource::NwmAna => SourceId::NwmAna,
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive range of hourly valid times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeRange {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self { start, end }
    }

    /// Every whole hour from start to end, inclusive.
    pub fn hours(&self) -> impl Iterator<Item = NaiveDateTime> + '_ {
        let first = floor_hour(self.start);
        std::iter::successors(Some(first), |t| Some(*t + Duration::hours(1)))
            .take_while(move |t| *t <= self.end)
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to {}",
            self.start.format("%Y-%m-%d %H:%M"),
            self.end.format("%Y-%m-%d %H:%M")
        )
    }
}

/// Period during which a source publishes data for a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Availability {
    pub start: NaiveDateTime,
    /// `None` for operational products that are still published
    pub end: Option<NaiveDateTime>,
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(
                f,
                "{} to {}",
                self.start.format("%Y-%m-%d %H:%M"),
                end.format("%Y-%m-%d %H:%M")
            ),
            None => write!(f, "{} onwards", self.start.format("%Y-%m-%d %H:%M")),
        }
    }
}

fn at(year: i32, month: u32, day: u32, hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, 0, 0))
        .expect("availability table holds valid dates")
}

fn floor_hour(t: NaiveDateTime) -> NaiveDateTime {
    t.date()
        .and_hms_opt(t.hour(), 0, 0)
        .unwrap_or(t)
}

/// Publication window of `source` for `domain`.
pub fn availability(source: SourceId, domain: CoastalDomain) -> Availability {
    use CoastalDomain::*;
    match (source, domain) {
        (SourceId::NwmRetro, Atlgulf | Pacific) => Availability {
            start: at(1979, 2, 1, 0),
            end: Some(at(2023, 2, 1, 0)),
        },
        (SourceId::NwmRetro, Hawaii) => Availability {
            start: at(1994, 1, 1, 0),
            end: Some(at(2013, 12, 31, 23)),
        },
        (SourceId::NwmRetro, Prvi) => Availability {
            start: at(2008, 1, 1, 0),
            end: Some(at(2023, 6, 30, 23)),
        },
        (SourceId::NwmAna, Atlgulf | Pacific) => Availability {
            start: at(2018, 9, 17, 0),
            end: None,
        },
        (SourceId::NwmAna, Hawaii | Prvi) => Availability {
            start: at(2021, 4, 20, 0),
            end: None,
        },
        (SourceId::Stofs, _) => Availability {
            start: at(2020, 12, 30, 0),
            end: None,
        },
    }
}

/// Clip `range` to the publication window of `source`.
///
/// A range that overlaps the window only partially is clipped with a
/// warning; a range entirely outside it is rejected.
pub fn clip_to_availability(
    source: SourceId,
    kind: DataKind,
    domain: CoastalDomain,
    range: TimeRange,
) -> Result<TimeRange, String> {
    let window = availability(source, domain);
    let start = range.start.max(window.start);
    let end = match window.end {
        Some(end) => range.end.min(end),
        None => range.end,
    };

    if start > end {
        return Err(format!(
            "{kind} data from {source} for {domain} is available {window}; requested {range}"
        ));
    }

    let clipped = TimeRange::new(start, end);
    if clipped != range {
        tracing::warn!(
            "{} data from {} for {} covers only {} of the requested {}",
            kind,
            source,
            domain,
            clipped,
            range
        );
    }
    Ok(clipped)
}

/// Location of one remote file and where it lands locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteFile {
    pub bucket: &'static str,
    pub key: String,
    pub destination: PathBuf,
}

/// NWM directory, analysis suffix and analysis region for a domain.
fn nwm_region(domain: CoastalDomain) -> (&'static str, &'static str, &'static str) {
    match domain {
        CoastalDomain::Atlgulf | CoastalDomain::Pacific => ("CONUS", "", "conus"),
        CoastalDomain::Hawaii => ("Hawaii", "_hawaii", "hawaii"),
        CoastalDomain::Prvi => ("PR", "_puertorico", "puertorico"),
    }
}

/// Directory receiving atmospheric forcing files.
pub fn meteo_dir(raw_dir: &Path, source: MeteoSource) -> PathBuf {
    raw_dir.join("meteo").join(source.as_str())
}

/// Directory receiving streamflow files.
pub fn streamflow_dir(raw_dir: &Path, source: MeteoSource) -> PathBuf {
    raw_dir.join("streamflow").join(source.as_str())
}

/// Directory receiving STOFS water level files.
pub fn coastal_dir(raw_dir: &Path) -> PathBuf {
    raw_dir.join("coastal").join("stofs")
}

/// Hourly atmospheric forcing file valid at `time`.
pub fn meteo_file(
    raw_dir: &Path,
    source: MeteoSource,
    domain: CoastalDomain,
    time: NaiveDateTime,
) -> RemoteFile {
    let (dir, suffix, region) = nwm_region(domain);
    let stamp = time.format("%Y%m%d%H");
    let key = match source {
        MeteoSource::NwmRetro => format!(
            "{dir}/netcdf/FORCING/{}/{stamp}.LDASIN_DOMAIN1",
            time.year()
        ),
        MeteoSource::NwmAna => format!(
            "nwm.{}/forcing_analysis_assim{suffix}/nwm.t{}z.analysis_assim.forcing.tm00.{region}.nc",
            time.format("%Y%m%d"),
            time.format("%H"),
        ),
    };
    RemoteFile {
        bucket: SourceId::from(source).bucket(),
        key,
        destination: meteo_dir(raw_dir, source).join(format!("{stamp}.LDASIN_DOMAIN1")),
    }
}

/// Hourly streamflow file valid at `time`.
pub fn streamflow_file(
    raw_dir: &Path,
    source: MeteoSource,
    domain: CoastalDomain,
    time: NaiveDateTime,
) -> RemoteFile {
    let (dir, suffix, region) = nwm_region(domain);
    let stamp = time.format("%Y%m%d%H");
    let key = match source {
        MeteoSource::NwmRetro => format!(
            "{dir}/netcdf/CHRTOUT/{}/{stamp}00.CHRTOUT_DOMAIN1",
            time.year()
        ),
        MeteoSource::NwmAna => format!(
            "nwm.{}/analysis_assim{suffix}/nwm.t{}z.analysis_assim.channel_rt.tm00.{region}.nc",
            time.format("%Y%m%d"),
            time.format("%H"),
        ),
    };
    RemoteFile {
        bucket: SourceId::from(source).bucket(),
        key,
        destination: streamflow_dir(raw_dir, source).join(format!("{stamp}00.CHRTOUT_DOMAIN1")),
    }
}

/// STOFS cycle (00, 06, 12 or 18Z) at or before `start`.
pub fn stofs_cycle(start: NaiveDateTime) -> NaiveDateTime {
    let hour = start.hour() - start.hour() % 6;
    start.date().and_hms_opt(hour, 0, 0).unwrap_or(start)
}

/// STOFS water level file covering a simulation starting at `start`.
pub fn stofs_file(raw_dir: &Path, start: NaiveDateTime) -> RemoteFile {
    let cycle = stofs_cycle(start);
    let day = cycle.format("%Y%m%d");
    let hour = cycle.format("%H");
    RemoteFile {
        bucket: STOFS_BUCKET,
        key: format!("stofs_2d_glo.{day}/stofs_2d_glo.t{hour}z.fields.cwl.nc"),
        destination: coastal_dir(raw_dir).join(format!("stofs_2d_glo.{day}.t{hour}z.fields.cwl.nc")),
    }
}
