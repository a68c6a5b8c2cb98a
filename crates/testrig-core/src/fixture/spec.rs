//! Install specifiers: `pip`-style package requirements and
//! `git+<url>[@<ref>]` source checkouts.

/// Prefix marking a version-control source.
pub const VCS_PREFIX: &str = "git+";

/// Ref checked out when a VCS specifier carries no `@<ref>` suffix.
pub const DEFAULT_BRANCH: &str = "master";

/// A source checkout to build and install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcsSource {
    /// Checkout directory name, derived from the last URL component.
    pub module: String,
    /// Repository URL without the `git+` prefix.
    pub url: String,
    /// Branch, tag or commit to reset to.
    pub git_ref: String,
}

impl VcsSource {
    /// Parse `git+<url>[@<ref>]`. Returns `None` for non-VCS specifiers or
    /// when no module name can be derived from the URL.
    ///
    /// The `@<ref>` suffix is only recognised in the last path component,
    /// so `git+ssh://git@host/repo.git` keeps its user part.
    #[must_use]
    pub fn parse(spec: &str) -> Option<Self> {
        let rest = spec.strip_prefix(VCS_PREFIX)?;
        let tail_start = rest.trim_end_matches('/').rfind('/').map_or(0, |i| i + 1);
        let (url, git_ref) = match rest[tail_start..].find('@') {
            Some(at) => {
                let split = tail_start + at;
                (&rest[..split], &rest[split + 1..])
            },
            None => (rest, DEFAULT_BRANCH),
        };
        let git_ref = if git_ref.is_empty() {
            DEFAULT_BRANCH
        } else {
            git_ref
        };

        let last = url.trim_end_matches('/').rsplit('/').next()?;
        let module = last.strip_suffix(".git").unwrap_or(last);
        if module.is_empty() || module == "." || module == ".." {
            return None;
        }

        Some(Self {
            module: module.to_string(),
            url: url.to_string(),
            git_ref: git_ref.to_string(),
        })
    }
}

/// Install specifiers split by installation mechanism.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallPlan {
    /// Requirements installed in one batched package-manager call.
    pub packages: Vec<String>,
    /// Source checkouts installed one at a time, in order.
    pub sources: Vec<VcsSource>,
}

impl InstallPlan {
    /// Partition `specs`, preserving relative order within each group.
    ///
    /// # Errors
    ///
    /// Returns the offending specifier if a `git+` entry has no usable
    /// module name.
    pub fn from_specs<S: AsRef<str>>(specs: &[S]) -> Result<Self, String> {
        let mut plan = Self::default();
        for spec in specs {
            let spec = spec.as_ref();
            if spec.starts_with(VCS_PREFIX) {
                plan.sources
                    .push(VcsSource::parse(spec).ok_or_else(|| spec.to_string())?);
            } else if !spec.is_empty() {
                plan.packages.push(spec.to_string());
            }
        }
        Ok(plan)
    }

    /// Whether there is nothing to install.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty() && self.sources.is_empty()
    }
}
