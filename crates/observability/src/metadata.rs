//! Build metadata stamped into the binary.

/// Identity of the running build.
///
/// Usually produced with [`build_info!`](crate::build_info), which reads the
/// package name and version at compile time and the optional `BUILD_TIME`
/// variable set by the release pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    pub service_name: String,
    pub version: String,
    pub build_time: String,
}

impl BuildInfo {
    pub fn new(
        service_name: impl Into<String>,
        version: impl Into<String>,
        build_time: impl Into<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            version: version.into(),
            build_time: build_time.into(),
        }
    }
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self::new("", "dev", "unknown")
    }
}

/// Capture [`BuildInfo`] for the calling crate.
#[macro_export]
macro_rules! build_info {
    () => {
        $crate::BuildInfo::new(
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            option_env!("BUILD_TIME").unwrap_or("unknown"),
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_build_is_unnamed_dev() {
        let b = BuildInfo::default();
        assert!(b.service_name.is_empty());
        assert_eq!(b.version, "dev");
        assert_eq!(b.build_time, "unknown");
    }

    #[test]
    fn macro_captures_this_package() {
        let b = crate::build_info!();
        assert_eq!(b.service_name, "observability");
        assert_eq!(b.version, env!("CARGO_PKG_VERSION"));
    }
}
