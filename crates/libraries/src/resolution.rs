use std::{
    fmt,
    path::PathBuf,
    str::FromStr,
    sync::{Arc, Mutex, PoisonError},
};

use url::Url;

use crate::ResolutionError;

pub const DESCRIPTOR_EXTENSION: &str = "json";
pub const DEFAULT_BRANCH: &str = "master";
const LIBRARIES_PATH: &str = "libraries";

/// The repository holding the canonical library descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GitHubRepository {
    pub owner: String,
    pub name: String,
}

impl Default for GitHubRepository {
    fn default() -> Self {
        Self {
            owner: "Kotlin".to_string(),
            name: "kotlin-jupyter".to_string(),
        }
    }
}

impl GitHubRepository {
    pub fn descriptor_url(&self, git_ref: &str, library: &str) -> Result<Url, ResolutionError> {
        let raw = format!(
            "https://raw.githubusercontent.com/{}/{}/{git_ref}/{LIBRARIES_PATH}/{library}.{DESCRIPTOR_EXTENSION}",
            self.owner, self.name
        );
        Url::parse(&raw).map_err(|e| ResolutionError::Fetch {
            location: raw.clone(),
            reason: e.to_string(),
        })
    }

    pub fn latest_commit_url(&self, branch: &str) -> Result<Url, ResolutionError> {
        let raw = format!(
            "https://api.github.com/repos/{}/{}/commits/{branch}",
            self.owner, self.name
        );
        Url::parse(&raw).map_err(|e| ResolutionError::Fetch {
            location: raw.clone(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Dir,
    GitRef,
    Url,
    File,
}

/// Where descriptors are looked up when a `%use` names a library without
/// saying where it lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionInfo {
    ByDir(PathBuf),
    ByGitRef {
        repository: GitHubRepository,
        git_ref: String,
    },
    /// Base url; `<name>.json` is resolved against it.
    ByUrl(Url),
    ByFile(PathBuf),
}

impl ResolutionInfo {
    pub fn kind(&self) -> SourceKind {
        match self {
            ResolutionInfo::ByDir(_) => SourceKind::Dir,
            ResolutionInfo::ByGitRef { .. } => SourceKind::GitRef,
            ResolutionInfo::ByUrl(_) => SourceKind::Url,
            ResolutionInfo::ByFile(_) => SourceKind::File,
        }
    }

    pub fn locate(&self, name: &str) -> Result<DescriptorSource, ResolutionError> {
        let file_name = format!("{name}.{DESCRIPTOR_EXTENSION}");

        match self {
            ResolutionInfo::ByDir(dir) => Ok(DescriptorSource::Dir(dir.join(file_name))),
            ResolutionInfo::ByGitRef {
                repository,
                git_ref,
            } => Ok(DescriptorSource::GitRef {
                repository: repository.clone(),
                git_ref: git_ref.clone(),
                name: name.to_string(),
            }),
            ResolutionInfo::ByUrl(base) => base
                .join(&file_name)
                .map(DescriptorSource::Url)
                .map_err(|e| ResolutionError::Fetch {
                    location: format!("{base}{file_name}"),
                    reason: e.to_string(),
                }),
            ResolutionInfo::ByFile(_) => Err(ResolutionError::UnsupportedFallback {
                name: name.to_string(),
                fallback: self.to_string(),
            }),
        }
    }
}

/// Parses `dir:PATH`, `file:PATH`, `git:REF` (descriptors repository) or
/// `url:BASE`.
impl FromStr for ResolutionInfo {
    type Err = ResolutionError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ResolutionError::Syntax {
            directive: text.to_string(),
            reason: reason.to_string(),
        };

        let (kind, value) = text
            .split_once(':')
            .ok_or_else(|| invalid("expected `dir:`, `file:`, `git:` or `url:`"))?;
        if value.is_empty() {
            return Err(invalid("missing location"));
        }

        match kind {
            "dir" => Ok(ResolutionInfo::ByDir(PathBuf::from(value))),
            "file" => Ok(ResolutionInfo::ByFile(PathBuf::from(value))),
            "git" => Ok(ResolutionInfo::ByGitRef {
                repository: GitHubRepository::default(),
                git_ref: value.to_string(),
            }),
            "url" => {
                let base = if value.ends_with('/') {
                    value.to_string()
                } else {
                    format!("{value}/")
                };
                Url::parse(&base)
                    .map(ResolutionInfo::ByUrl)
                    .map_err(|e| invalid(&e.to_string()))
            }
            _ => Err(invalid("expected `dir:`, `file:`, `git:` or `url:`")),
        }
    }
}

impl fmt::Display for ResolutionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionInfo::ByDir(dir) => write!(f, "directory {}", dir.display()),
            ResolutionInfo::ByGitRef {
                repository,
                git_ref,
            } => write!(f, "{}/{}@{git_ref}", repository.owner, repository.name),
            ResolutionInfo::ByUrl(url) => write!(f, "url {url}"),
            ResolutionInfo::ByFile(path) => write!(f, "file {}", path.display()),
        }
    }
}

/// A concrete descriptor location. Also the resolver's cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DescriptorSource {
    Dir(PathBuf),
    GitRef {
        repository: GitHubRepository,
        git_ref: String,
        name: String,
    },
    Url(Url),
    File(PathBuf),
}

impl DescriptorSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            DescriptorSource::Dir(_) => SourceKind::Dir,
            DescriptorSource::GitRef { .. } => SourceKind::GitRef,
            DescriptorSource::Url(_) => SourceKind::Url,
            DescriptorSource::File(_) => SourceKind::File,
        }
    }
}

impl fmt::Display for DescriptorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptorSource::Dir(path) | DescriptorSource::File(path) => {
                write!(f, "{}", path.display())
            }
            DescriptorSource::GitRef {
                repository,
                git_ref,
                name,
            } => write!(f, "{name} at {}/{}@{git_ref}", repository.owner, repository.name),
            DescriptorSource::Url(url) => write!(f, "{url}"),
        }
    }
}

/// Holds the fallback resolution info.
///
/// The fallback can be swapped at runtime (`%useLatestDescriptors`); the value
/// captured at construction is kept so it can be restored as the same `Arc`.
#[derive(Debug)]
pub struct ResolutionInfoProvider {
    initial: Arc<ResolutionInfo>,
    fallback: Mutex<Arc<ResolutionInfo>>,
}

impl ResolutionInfoProvider {
    pub fn new(initial: ResolutionInfo) -> Self {
        let initial = Arc::new(initial);
        Self {
            fallback: Mutex::new(initial.clone()),
            initial,
        }
    }

    pub fn initial(&self) -> Arc<ResolutionInfo> {
        self.initial.clone()
    }

    pub fn fallback(&self) -> Arc<ResolutionInfo> {
        self.slot().clone()
    }

    /// Returns the fallback that was replaced.
    pub fn set_fallback(&self, info: Arc<ResolutionInfo>) -> Arc<ResolutionInfo> {
        std::mem::replace(&mut *self.slot(), info)
    }

    pub fn reset_fallback(&self) -> Arc<ResolutionInfo> {
        self.set_fallback(self.initial.clone())
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Arc<ResolutionInfo>> {
        self.fallback.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;

    #[googletest::test]
    fn resolution_info_is_parsed_from_its_short_form() {
        expect_that!(
            "dir:/opt/libraries".parse::<ResolutionInfo>().unwrap(),
            eq(ResolutionInfo::ByDir(PathBuf::from("/opt/libraries")))
        );
        expect_that!(
            "git:v0.12.0".parse::<ResolutionInfo>().unwrap(),
            eq(ResolutionInfo::ByGitRef {
                repository: GitHubRepository::default(),
                git_ref: "v0.12.0".to_string(),
            })
        );
        expect_that!(
            "url:https://example.com/descriptors"
                .parse::<ResolutionInfo>()
                .unwrap()
                .locate("kandy")
                .unwrap(),
            eq(DescriptorSource::Url(
                Url::parse("https://example.com/descriptors/kandy.json").unwrap()
            ))
        );
        expect_that!(
            "somewhere".parse::<ResolutionInfo>(),
            err(pat!(ResolutionError::Syntax { directive: eq("somewhere"), reason: anything() }))
        );
        expect_that!("ftp:x".parse::<ResolutionInfo>(), err(anything()));
    }

    #[googletest::test]
    fn named_libraries_are_located_per_fallback_kind() {
        let by_dir = ResolutionInfo::ByDir(PathBuf::from("/opt/libraries"));
        expect_that!(
            by_dir.locate("kandy"),
            pat!(Ok(eq(DescriptorSource::Dir(PathBuf::from("/opt/libraries/kandy.json")))))
        );

        let by_url = ResolutionInfo::ByUrl(Url::parse("https://example.com/descriptors/").unwrap());
        expect_that!(
            by_url.locate("kandy"),
            pat!(Ok(eq(DescriptorSource::Url(
                Url::parse("https://example.com/descriptors/kandy.json").unwrap()
            ))))
        );

        let by_file = ResolutionInfo::ByFile(PathBuf::from("one.json"));
        expect_that!(
            by_file.locate("kandy"),
            pat!(Err(pat!(ResolutionError::UnsupportedFallback {
                name: eq("kandy"),
                fallback: anything()
            })))
        );
    }

    #[googletest::test]
    fn git_refs_map_to_raw_content_urls() {
        let url = GitHubRepository::default()
            .descriptor_url("cfcf825", "lets-plot")
            .unwrap();

        expect_that!(
            url.as_str(),
            eq("https://raw.githubusercontent.com/Kotlin/kotlin-jupyter/cfcf825/libraries/lets-plot.json")
        );
    }

    #[googletest::test]
    fn reset_restores_the_initial_fallback_instance() {
        let provider = ResolutionInfoProvider::new(ResolutionInfo::ByDir(PathBuf::from("libs")));
        let initial = provider.fallback();

        let previous = provider.set_fallback(Arc::new(ResolutionInfo::ByGitRef {
            repository: GitHubRepository::default(),
            git_ref: "master".to_string(),
        }));
        expect_that!(Arc::ptr_eq(&previous, &initial), eq(true));
        expect_that!(provider.fallback().kind(), eq(SourceKind::GitRef));

        provider.reset_fallback();
        expect_that!(Arc::ptr_eq(&provider.fallback(), &initial), eq(true));
    }
}
