use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use clap::{ArgAction, Parser, ValueEnum};
use tracing::info;
use url::Url;

use crate::error::{PandaError, Result};

const COOKIE_MEMBER_ID: &str = "ipb_member_id";

/// The operation mode of the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OperationMode {
    /// Archive new galleries from a search result.
    Download,
    /// Refresh already archived galleries.
    Update,
    /// Remove outdated galleries.
    Cleanup,
}

/// A gallery element kind that can be skipped during archival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum Element {
    Metadata,
    Page,
    Imagelist,
    Expungelog,
    Thumbnail,
    Torrent,
    Zip,
}

/// Command line arguments as entered by the operator.
#[derive(Parser, Debug)]
#[command(name = "rippanda", version, about = "Archival agent for panda galleries")]
pub struct Args {
    /// Operation mode
    #[arg(value_enum, default_value = "download", ignore_case = true)]
    pub mode: OperationMode,

    /// Log-in / perk cookies in key=value pairs separated by ;
    #[arg(short, long, value_name = "cookies")]
    pub cookies: String,

    /// SOCKS5 proxy to use for network requests and DNS resolution
    #[arg(short, long, value_name = "host:port")]
    pub proxy: Option<String>,

    /// Base URL to use for web requests or a more specific search URL if in download mode
    #[arg(short, long, value_name = "url")]
    pub url: Url,

    /// Minimum delay between web requests in ISO-8601 time format
    #[arg(short, long, value_name = "time", default_value = "15S")]
    pub delay: String,

    /// Update interval thresholds in the form minT=minD-maxT=maxD (ISO-8601 period parts)
    #[arg(short = 'i', long, value_name = "period", default_value = "0D=7D-365D=90D")]
    pub update_interval: String,

    /// Directories containing archived galleries (first occurrence denotes the writable primary path)
    #[arg(short, long, value_name = "path", default_value = ".")]
    pub archive_dir: Vec<PathBuf>,

    /// Directory containing success files
    #[arg(short, long, value_name = "path", default_value = ".")]
    pub success_dir: PathBuf,

    /// Specify multiple times to skip elements during the archival process
    #[arg(short = 'e', long = "skip", value_name = "element", value_enum)]
    pub skip: Vec<Element>,

    /// Stop paginating once a whole page of galleries had already been archived
    #[arg(short = 't', long)]
    pub catchup: bool,

    /// Specify up to 7 times to override logging verbosity
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

/// Validated application settings shared by every component.
#[derive(Debug, Clone)]
pub struct Settings {
    mode: OperationMode,
    cookies: Vec<(String, String)>,
    member_id: String,
    proxy: Option<String>,
    url: Url,
    base_url: Url,
    request_delay: Duration,
    update_interval: UpdateInterval,
    archive_dirs: Vec<PathBuf>,
    success_dir: PathBuf,
    skip: HashSet<Element>,
    catchup: bool,
    verbosity: u8,
}

impl Settings {
    pub fn from_args(args: Args) -> Result<Self> {
        let mut cookies = parse_cookies(&args.cookies)?;
        let member_id = cookies
            .iter()
            .find(|(name, _)| name == COOKIE_MEMBER_ID)
            .map(|(_, value)| value.clone())
            .ok_or_else(|| PandaError::config("no valid member ID found in cookies"))?;

        // do not warn on questionable content, do not send the daily event
        // timestamp or stale CloudFlare ids
        if !cookies.iter().any(|(name, _)| name == "nw") {
            cookies.push(("nw".to_string(), "1".to_string()));
        }
        cookies.retain(|(name, _)| name != "event" && name != "__cfduid");

        if let Some(proxy) = &args.proxy {
            validate_proxy(proxy)?;
        }

        if args.archive_dir.is_empty() {
            return Err(PandaError::config("at least one archive directory is required"));
        }

        let base_url = base_url_of(&args.url)?;
        let request_delay = parse_time_part(&args.delay)?;
        let update_interval = UpdateInterval::parse(&args.update_interval)?;

        Ok(Settings {
            mode: args.mode,
            cookies,
            member_id,
            proxy: args.proxy,
            url: args.url,
            base_url,
            request_delay,
            update_interval,
            archive_dirs: args.archive_dir,
            success_dir: args.success_dir,
            skip: args.skip.into_iter().collect(),
            catchup: args.catchup,
            verbosity: args.verbose,
        })
    }

    /// Logs the effective configuration the run will use.
    pub fn log_banner(&self) {
        info!("Using the following configuration:");
        info!("Operation mode: {:?}", self.mode);
        info!("Proxy: {}", self.proxy.as_deref().unwrap_or("none"));
        info!("URL: {}", self.url);
        info!("Request delay: {:?}", self.request_delay);
        info!("Update interval: {}", self.update_interval);
        info!("Archive directories: {:?}", self.archive_dirs);
        info!("Writable archive directory: {}", self.writable_archive_dir().display());
        info!("Success directory: {}", self.success_dir.display());
        for element in [
            Element::Metadata,
            Element::Page,
            Element::Imagelist,
            Element::Expungelog,
            Element::Thumbnail,
            Element::Torrent,
            Element::Zip,
        ] {
            info!("{:?} active: {}", element, self.is_active(element));
        }
    }

    pub fn mode(&self) -> OperationMode {
        self.mode
    }

    pub fn cookies(&self) -> &[(String, String)] {
        &self.cookies
    }

    /// The member id doubling as this user's success-file id.
    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The configured URL stripped down to scheme and host.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn request_delay(&self) -> Duration {
        self.request_delay
    }

    pub fn update_interval(&self) -> &UpdateInterval {
        &self.update_interval
    }

    pub fn archive_dirs(&self) -> &[PathBuf] {
        &self.archive_dirs
    }

    /// The first configured archive directory is the only writable one.
    pub fn writable_archive_dir(&self) -> &PathBuf {
        &self.archive_dirs[0]
    }

    pub fn success_dir(&self) -> &PathBuf {
        &self.success_dir
    }

    pub fn is_active(&self, element: Element) -> bool {
        !self.skip.contains(&element)
    }

    pub fn catchup(&self) -> bool {
        self.catchup
    }

    pub fn verbosity(&self) -> u8 {
        self.verbosity
    }
}

/// Four-duration refresh interval configuration.
///
/// Galleries younger than `min_threshold` are refreshed every `min_duration`,
/// galleries older than `max_threshold` every `max_duration`, anything in
/// between linearly interpolated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateInterval {
    min_threshold: TimeDelta,
    min_duration: TimeDelta,
    max_threshold: TimeDelta,
    max_duration: TimeDelta,
}

impl UpdateInterval {
    pub fn new(
        min_threshold: TimeDelta,
        min_duration: TimeDelta,
        max_threshold: TimeDelta,
        max_duration: TimeDelta,
    ) -> Result<Self> {
        if min_threshold > max_threshold || min_duration > max_duration {
            return Err(PandaError::config(
                "minimum update threshold or duration must not be greater than the maximum one",
            ));
        }
        Ok(UpdateInterval {
            min_threshold,
            min_duration,
            max_threshold,
            max_duration,
        })
    }

    /// Parses the `minT=minD-maxT=maxD` command line form. A single `T=D`
    /// pair applies to both ends.
    pub fn parse(value: &str) -> Result<Self> {
        let (min_part, max_part) = match value.split_once('-') {
            Some((min, max)) => (min, max),
            None => (value, value),
        };
        let (min_threshold, min_duration) = parse_interval_pair(min_part)?;
        let (max_threshold, max_duration) = parse_interval_pair(max_part)?;

        UpdateInterval::new(min_threshold, min_duration, max_threshold, max_duration)
    }

    /// Computes the refresh threshold for a gallery posted at the given time.
    /// Files modified before the returned instant are considered stale.
    pub fn update_threshold(&self, posted: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        let age = now - posted;
        let ratio = if age < self.min_threshold {
            0.0
        } else if age > self.max_threshold {
            1.0
        } else {
            let position = age - self.min_threshold;
            let difference = self.max_threshold - self.min_threshold;
            if difference.is_zero() {
                0.0
            } else {
                position.num_seconds() as f64 / difference.num_seconds() as f64
            }
        };

        let millis_to_add =
            ((self.max_duration - self.min_duration).num_milliseconds() as f64 * ratio).round() as i64;
        let interval = self.min_duration + TimeDelta::milliseconds(millis_to_add);

        now - interval
    }
}

impl std::fmt::Display for UpdateInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}d={}d-{}d={}d",
            self.min_threshold.num_days(),
            self.min_duration.num_days(),
            self.max_threshold.num_days(),
            self.max_duration.num_days()
        )
    }
}

fn parse_interval_pair(value: &str) -> Result<(TimeDelta, TimeDelta)> {
    let (threshold, duration) = value
        .split_once('=')
        .ok_or_else(|| PandaError::config(format!("invalid update interval part: \"{value}\"")))?;
    let threshold = parse_period_part(threshold)?;
    let duration = parse_period_part(duration)?;

    let to_delta = |d: Duration| {
        TimeDelta::from_std(d)
            .map_err(|_| PandaError::config(format!("update interval part out of range: \"{value}\"")))
    };
    Ok((to_delta(threshold)?, to_delta(duration)?))
}

/// Parses the time part of an ISO-8601 duration, e.g. `15S`, `1M30S`, `2H`.
pub fn parse_time_part(value: &str) -> Result<Duration> {
    let normalized = value
        .trim()
        .trim_start_matches("PT")
        .trim_start_matches("pt")
        .trim_start_matches(['T', 't']);
    parse_units(normalized, &[('H', 3600), ('M', 60), ('S', 1)])
        .ok_or_else(|| PandaError::config(format!("invalid time value: \"{value}\"")))
}

/// Parses the period part of an ISO-8601 duration, e.g. `7D`, `2W`, `1Y`.
/// Months count as 30 days, years as 365.
pub fn parse_period_part(value: &str) -> Result<Duration> {
    const DAY: u64 = 24 * 3600;
    let normalized = value.trim().trim_start_matches(['P', 'p']);
    parse_units(
        normalized,
        &[('Y', 365 * DAY), ('M', 30 * DAY), ('W', 7 * DAY), ('D', DAY)],
    )
    .ok_or_else(|| PandaError::config(format!("invalid period value: \"{value}\"")))
}

fn parse_units(value: &str, units: &[(char, u64)]) -> Option<Duration> {
    if value.is_empty() {
        return None;
    }

    let mut total = 0u64;
    let mut number = String::new();
    let mut next_unit = 0;
    for c in value.chars() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }

        let unit = c.to_ascii_uppercase();
        // units must appear in descending order, each at most once
        let index = units[next_unit..].iter().position(|(u, _)| *u == unit)?;
        let seconds = units[next_unit + index].1;
        next_unit += index + 1;

        let amount: u64 = number.parse().ok()?;
        number.clear();
        total = total.checked_add(amount.checked_mul(seconds)?)?;
    }

    if !number.is_empty() {
        // trailing digits without a unit
        return None;
    }

    Some(Duration::from_secs(total))
}

fn parse_cookies(value: &str) -> Result<Vec<(String, String)>> {
    let mut cookies = Vec::new();
    for pair in value.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (name, cookie_value) = pair
            .split_once('=')
            .ok_or_else(|| PandaError::config(format!("invalid cookie pair: \"{pair}\"")))?;
        cookies.push((name.trim().to_string(), cookie_value.trim().to_string()));
    }

    if cookies.is_empty() {
        return Err(PandaError::config("no cookies provided"));
    }

    Ok(cookies)
}

fn validate_proxy(value: &str) -> Result<()> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| PandaError::config(format!("invalid proxy address: \"{value}\"")))?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(PandaError::config(format!("invalid proxy address: \"{value}\"")));
    }

    Ok(())
}

fn base_url_of(url: &Url) -> Result<Url> {
    if url.cannot_be_a_base() {
        return Err(PandaError::config(format!("URL cannot be used as a base: \"{url}\"")));
    }
    let mut base = url.clone();
    base.set_path("");
    base.set_query(None);
    base.set_fragment(None);

    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn settings_from(args: &[&str]) -> Result<Settings> {
        Settings::from_args(Args::parse_from(args))
    }

    const BASE_ARGS: &[&str] = &[
        "rippanda",
        "-c",
        "ipb_member_id=42; ipb_pass_hash=abc; event=1; __cfduid=x",
        "-u",
        "https://host.example/?f_search=test",
    ];

    #[test]
    fn cookies_are_cleaned_up() {
        let settings = settings_from(BASE_ARGS).unwrap();
        assert_eq!(settings.member_id(), "42");
        let names: Vec<&str> = settings.cookies().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["ipb_member_id", "ipb_pass_hash", "nw"]);
    }

    #[test]
    fn member_id_is_mandatory() {
        let result = settings_from(&[
            "rippanda",
            "-c",
            "ipb_pass_hash=abc",
            "-u",
            "https://host.example/",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn base_url_drops_path_and_query() {
        let settings = settings_from(BASE_ARGS).unwrap();
        assert_eq!(settings.base_url().as_str(), "https://host.example/");
    }

    #[test]
    fn delay_defaults_to_fifteen_seconds() {
        let settings = settings_from(BASE_ARGS).unwrap();
        assert_eq!(settings.request_delay(), Duration::from_secs(15));
    }

    #[test]
    fn time_parts_parse() {
        assert_eq!(parse_time_part("15S").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_time_part("1M30S").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_time_part("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_time_part("abc").is_err());
        assert!(parse_time_part("15").is_err());
    }

    #[test]
    fn period_parts_parse() {
        assert_eq!(parse_period_part("7D").unwrap(), Duration::from_secs(7 * 86400));
        assert_eq!(parse_period_part("2W").unwrap(), Duration::from_secs(14 * 86400));
        assert_eq!(parse_period_part("1Y").unwrap(), Duration::from_secs(365 * 86400));
        assert!(parse_period_part("7X").is_err());
    }

    #[test]
    fn update_interval_parses_both_forms() {
        let full = UpdateInterval::parse("0D=7D-365D=90D").unwrap();
        let degenerate = UpdateInterval::parse("30D=14D").unwrap();
        assert_eq!(
            full,
            UpdateInterval::new(
                TimeDelta::zero(),
                TimeDelta::days(7),
                TimeDelta::days(365),
                TimeDelta::days(90),
            )
            .unwrap()
        );
        assert_eq!(
            degenerate,
            UpdateInterval::new(
                TimeDelta::days(30),
                TimeDelta::days(14),
                TimeDelta::days(30),
                TimeDelta::days(14),
            )
            .unwrap()
        );
    }

    #[test]
    fn update_interval_rejects_inverted_bounds() {
        assert!(UpdateInterval::parse("365D=7D-0D=90D").is_err());
        assert!(UpdateInterval::parse("0D=90D-365D=7D").is_err());
    }

    #[test]
    fn update_threshold_boundaries() {
        let interval = UpdateInterval::parse("0D=7D-365D=90D").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

        // posted right now: minimum refresh interval applies
        let threshold = interval.update_threshold(now, now);
        assert_eq!(threshold, now - TimeDelta::days(7));

        // posted 400 days ago: maximum refresh interval applies
        let threshold = interval.update_threshold(now - TimeDelta::days(400), now);
        assert_eq!(threshold, now - TimeDelta::days(90));

        // posted exactly halfway: linear interpolation, ±1 s
        let posted = now - TimeDelta::hours(182 * 24 + 12);
        let threshold = interval.update_threshold(posted, now);
        let expected = now - (TimeDelta::days(7) + TimeDelta::milliseconds((83.0 * 86400000.0 / 2.0) as i64));
        let drift = (threshold - expected).num_seconds().abs();
        assert!(drift <= 1, "threshold drifted by {drift}s");
    }

    #[test]
    fn update_threshold_thirty_day_old_gallery() {
        let interval = UpdateInterval::parse("0D=7D-365D=90D").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let threshold = interval.update_threshold(now - TimeDelta::days(30), now);

        // 7d + (30/365) * 83d ≈ 13.82d
        let interval_days = (now - threshold).num_seconds() as f64 / 86400.0;
        assert!((interval_days - 13.82).abs() < 0.01, "got {interval_days}");
    }

    #[test]
    fn proxy_addresses_are_validated() {
        assert!(validate_proxy("127.0.0.1:1080").is_ok());
        assert!(validate_proxy("localhost:9050").is_ok());
        assert!(validate_proxy("nonsense").is_err());
        assert!(validate_proxy("host:notaport").is_err());
    }
}
