use std::env;
use std::fs;
use std::path::Path;

use cargo_lock::{Lockfile, Package};
use chrono::{DateTime, SecondsFormat, Utc};
use git2::Repository;

const UNKNOWN: &str = "unknown";
const DRIVER_CRATE: &str = "mongodb";

/// Where the MongoDB driver linked into the binary comes from.
struct DriverInfo {
    version: String,
    date: String,
    sha: String,
}

impl DriverInfo {
    fn unknown() -> Self {
        Self {
            version: UNKNOWN.into(),
            date: UNKNOWN.into(),
            sha: UNKNOWN.into(),
        }
    }

    fn from_package(pkg: &Package) -> Self {
        let version = pkg.version.to_string();
        let source = pkg.source.as_ref().map(|s| s.to_string());
        match source {
            // A path dependency, i.e. a local checkout of the driver
            None => Self {
                version: format!("{version}-dev"),
                date: rfc3339(Utc::now()),
                sha: UNKNOWN.into(),
            },
            Some(source) if source.starts_with("git+") => {
                let sha = source
                    .rsplit_once('#')
                    .map_or(UNKNOWN, |(_, sha)| sha)
                    .to_string();
                Self {
                    version: format!("{version}-dev"),
                    date: release_info::commit_date(&sha).unwrap_or_else(|| UNKNOWN.into()),
                    sha,
                }
            }
            Some(_) => Self {
                date: release_info::crate_release_date(DRIVER_CRATE, &version)
                    .unwrap_or_else(|| UNKNOWN.into()),
                version,
                sha: "official_release".into(),
            },
        }
    }
}

fn rfc3339(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

// Looking dates up needs network access, so it is opt-in
#[cfg(fetch_extended_version_info)]
mod release_info {
    use std::time::Duration;

    use chrono::{DateTime, Utc};
    use reqwest::blocking::Client;
    use serde_json::Value;

    fn fetch(url: &str) -> Option<Value> {
        let response = Client::builder()
            .timeout(Duration::from_secs(5))
            .user_agent("doc-stress build script")
            .build()
            .ok()?
            .get(url)
            .send()
            .ok()?;
        if !response.status().is_success() {
            println!("cargo:warning=GET {url} returned {}", response.status());
            return None;
        }
        response.json().ok()
    }

    fn normalize(date: &str) -> Option<String> {
        let dt = DateTime::parse_from_rfc3339(date).ok()?;
        Some(super::rfc3339(dt.with_timezone(&Utc)))
    }

    pub fn commit_date(sha: &str) -> Option<String> {
        let commit = fetch(&format!(
            "https://api.github.com/repos/mongodb/mongo-rust-driver/commits/{sha}"
        ))?;
        normalize(commit.pointer("/commit/author/date")?.as_str()?)
    }

    pub fn crate_release_date(name: &str, version: &str) -> Option<String> {
        let versions = fetch(&format!("https://crates.io/api/v1/crates/{name}/versions"))?;
        let release = versions
            .get("versions")?
            .as_array()?
            .iter()
            .find(|v| v.get("num").and_then(Value::as_str) == Some(version))?;
        normalize(release.get("created_at")?.as_str()?)
    }
}

#[cfg(not(fetch_extended_version_info))]
mod release_info {
    const NOT_FETCHED: &str = "unknown (build with --cfg fetch_extended_version_info)";

    pub fn commit_date(_sha: &str) -> Option<String> {
        Some(NOT_FETCHED.into())
    }

    pub fn crate_release_date(_name: &str, _version: &str) -> Option<String> {
        Some(NOT_FETCHED.into())
    }
}

fn driver_info() -> DriverInfo {
    let Ok(lockfile) = Lockfile::load("Cargo.lock") else {
        return DriverInfo::unknown();
    };
    match lockfile
        .packages
        .iter()
        .find(|pkg| pkg.name.as_str() == DRIVER_CRATE)
    {
        Some(pkg) => DriverInfo::from_package(pkg),
        None => {
            println!("cargo:warning={DRIVER_CRATE} is missing from Cargo.lock");
            DriverInfo::unknown()
        }
    }
}

// Date and sha of the commit this crate is built from
fn head_commit() -> Option<(String, String)> {
    let repo = Repository::open(".").ok()?;
    let commit = repo.head().ok()?.peel_to_commit().ok()?;
    let date = DateTime::<Utc>::from_timestamp(commit.time().seconds(), 0)?;
    Some((rfc3339(date), commit.id().to_string()))
}

fn main() {
    let out_dir = env::var_os("OUT_DIR").expect("cargo sets OUT_DIR for build scripts");
    let (commit_date, commit_sha) =
        head_commit().unwrap_or_else(|| (UNKNOWN.into(), UNKNOWN.into()));
    let driver = driver_info();

    let constants = [
        ("PKG_VERSION", env!("CARGO_PKG_VERSION").to_string()),
        ("COMMIT_DATE", commit_date),
        ("GIT_SHA", commit_sha),
        ("DRIVER_VERSION", driver.version),
        ("DRIVER_RELEASE_DATE", driver.date),
        ("DRIVER_SHA", driver.sha),
    ];
    let source: String = constants
        .iter()
        .map(|(name, value)| format!("pub const {name}: &str = {value:?};\n"))
        .collect();
    fs::write(Path::new(&out_dir).join("version_info.rs"), source)
        .expect("failed to write version_info.rs");

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=Cargo.lock");
    println!("cargo:rerun-if-changed=.git/HEAD");
}
