//! Build information printed by `-version`.

#[derive(Debug)]
pub struct VersionInfo {
    pub version: &'static str,
    pub commit_date: &'static str,
    pub commit_sha: &'static str,
    pub driver_version: &'static str,
    pub driver_date: &'static str,
    pub driver_sha: &'static str,
}

mod version_info {
    include!(concat!(env!("OUT_DIR"), "/version_info.rs"));
}

pub fn get_version_info() -> VersionInfo {
    VersionInfo {
        version: version_info::PKG_VERSION,
        commit_date: version_info::COMMIT_DATE,
        commit_sha: version_info::GIT_SHA,
        driver_version: version_info::DRIVER_VERSION,
        driver_date: version_info::DRIVER_RELEASE_DATE,
        driver_sha: version_info::DRIVER_SHA,
    }
}

pub fn format_version_info_json() -> String {
    let info = get_version_info();
    format!(
        r#"{{"doc-stress":{{"version":"{}","commit_date":"{}","commit_sha":"{}"}},"mongodb-driver":{{"version":"{}","commit_date":"{}","commit_sha":"{}"}}}}"#,
        info.version,
        info.commit_date,
        info.commit_sha,
        info.driver_version,
        info.driver_date,
        info.driver_sha,
    )
}

pub fn format_version_info_human() -> String {
    let info = get_version_info();
    format!(
        "doc-stress:\n\
         - Version: {}\n\
         - Build Date: {}\n\
         - Git SHA: {}\n\
         mongodb-driver:\n\
         - Version: {}\n\
         - Release Date: {}\n\
         - Git SHA: {}",
        info.version,
        info.commit_date,
        info.commit_sha,
        info.driver_version,
        info.driver_date,
        info.driver_sha
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_formats() {
        let human = format_version_info_human();
        assert!(human.starts_with("doc-stress:\n- Version: "));
        assert!(human.contains(env!("CARGO_PKG_VERSION")));

        let json = format_version_info_json();
        assert!(json.starts_with(r#"{"doc-stress":{"version":""#));
        assert!(json.contains(r#""mongodb-driver":{"version":"#));
    }
}
