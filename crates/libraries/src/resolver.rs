use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde_json::Value;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::{
    descriptor::LibraryDescriptor,
    directive::{Directive, LibraryReference, LibrarySource},
    fetch::DescriptorFetcher,
    resolution::{
        DescriptorSource, GitHubRepository, ResolutionInfo, ResolutionInfoProvider,
        DEFAULT_BRANCH, DESCRIPTOR_EXTENSION,
    },
    ResolutionError,
};

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Fallback used for bare library names at session start.
    pub initial: ResolutionInfo,
    /// User-level descriptors; consulted before the fallback.
    pub local_libraries_dir: Option<PathBuf>,
    pub repository: GitHubRepository,
}

/// Everything the directives of one cell ask for, merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellSetup {
    pub libraries: Vec<String>,
    pub repositories: Vec<String>,
    pub dependencies: Vec<String>,
    pub compiler_arguments: Vec<String>,
    /// One block per library, in directive order.
    pub init_code: Vec<String>,
    pub shutdown_code: Vec<String>,
}

impl CellSetup {
    pub fn add_repository(&mut self, repository: &str) {
        push_unique(&mut self.repositories, repository);
    }

    pub fn add_dependency(&mut self, coordinates: &str) {
        push_unique(&mut self.dependencies, coordinates);
    }

    pub fn add_library(&mut self, name: String, descriptor: LibraryDescriptor) {
        for repository in &descriptor.repositories {
            self.add_repository(repository);
        }
        for dependency in &descriptor.dependencies {
            self.add_dependency(dependency);
        }
        self.compiler_arguments
            .extend(descriptor.compiler_arguments.iter().cloned());

        let mut block: Vec<String> = descriptor
            .imports
            .iter()
            .map(|import| format!("import {import}"))
            .collect();
        block.extend(descriptor.init);
        if !block.is_empty() {
            self.init_code.push(block.join("\n"));
        }

        if !descriptor.shutdown.is_empty() {
            self.shutdown_code.push(descriptor.shutdown.join("\n"));
        }

        self.libraries.push(name);
    }

    pub fn needs_configuration(&self) -> bool {
        !self.repositories.is_empty()
            || !self.dependencies.is_empty()
            || !self.compiler_arguments.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        !self.needs_configuration() && self.init_code.is_empty() && self.shutdown_code.is_empty()
    }
}

fn push_unique(items: &mut Vec<String>, item: &str) {
    if !items.iter().any(|existing| existing == item) {
        items.push(item.to_string());
    }
}

pub struct LibraryResolver {
    local_libraries_dir: Option<PathBuf>,
    repository: GitHubRepository,
    provider: Arc<ResolutionInfoProvider>,
    fetcher: Arc<dyn DescriptorFetcher>,
    cache: HashMap<DescriptorSource, Arc<LibraryDescriptor>>,
}

impl LibraryResolver {
    pub fn new(config: ResolverConfig, fetcher: Arc<dyn DescriptorFetcher>) -> Self {
        Self {
            local_libraries_dir: config.local_libraries_dir,
            repository: config.repository,
            provider: Arc::new(ResolutionInfoProvider::new(config.initial)),
            fetcher,
            cache: HashMap::new(),
        }
    }

    pub fn provider(&self) -> Arc<ResolutionInfoProvider> {
        self.provider.clone()
    }

    /// Resolves against the provider's current fallback.
    pub async fn resolve(
        &mut self,
        reference: &LibraryReference,
    ) -> Result<LibraryDescriptor, ResolutionError> {
        let fallback = self.provider.fallback();
        self.resolve_with(reference, &fallback).await
    }

    pub async fn resolve_with(
        &mut self,
        reference: &LibraryReference,
        fallback: &ResolutionInfo,
    ) -> Result<LibraryDescriptor, ResolutionError> {
        let source = self.locate(&reference.source, fallback).await?;
        let descriptor = self.load(source).await?;
        descriptor.bind(&reference.source.display_name(), &reference.arguments)
    }

    /// Resolves every directive of a cell. Nothing is applied here; a failure
    /// leaves the session untouched apart from `%useLatestDescriptors` swaps
    /// that already happened.
    pub async fn prepare(&mut self, directives: &[Directive]) -> Result<CellSetup, ResolutionError> {
        let mut setup = CellSetup::default();

        for directive in directives {
            match directive {
                Directive::Use(references) => {
                    for reference in references {
                        let descriptor = self.resolve(reference).await?;
                        setup.add_library(reference.source.display_name(), descriptor);
                    }
                }
                Directive::UseLatestDescriptors(enabled) => {
                    self.use_latest_descriptors(*enabled).await;
                }
                Directive::DependsOn(coordinates) => setup.add_dependency(coordinates),
                Directive::Repository(repository) => setup.add_repository(repository),
                Directive::CompilerArgs(arguments) => {
                    setup.compiler_arguments.extend(arguments.iter().cloned())
                }
            }
        }

        Ok(setup)
    }

    /// Switches the fallback to the newest commit of the descriptors repository,
    /// or back to the session-start fallback. Returns the fallback now in effect.
    pub async fn use_latest_descriptors(&self, enabled: bool) -> Arc<ResolutionInfo> {
        if !enabled {
            self.provider.reset_fallback();
            let fallback = self.provider.fallback();
            info!(%fallback, "restored library descriptors fallback");
            return fallback;
        }

        let git_ref = match self.latest_commit().await {
            Ok(sha) => sha,
            Err(e) => {
                warn!(error = %e, "could not determine latest descriptors commit, using {DEFAULT_BRANCH}");
                DEFAULT_BRANCH.to_string()
            }
        };

        let fallback = Arc::new(ResolutionInfo::ByGitRef {
            repository: self.repository.clone(),
            git_ref,
        });
        self.provider.set_fallback(fallback.clone());
        info!(%fallback, "using latest library descriptors");

        fallback
    }

    async fn latest_commit(&self) -> Result<String, ResolutionError> {
        let url = self.repository.latest_commit_url(DEFAULT_BRANCH)?;
        let body = self.fetcher.fetch(&url).await?;
        let unexpected = |reason: String| ResolutionError::Fetch {
            location: url.to_string(),
            reason,
        };

        let value: Value = serde_json::from_str(&body).map_err(|e| unexpected(e.to_string()))?;
        value
            .get("sha")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| unexpected("response carries no commit sha".to_string()))
    }

    async fn locate(
        &self,
        source: &LibrarySource,
        fallback: &ResolutionInfo,
    ) -> Result<DescriptorSource, ResolutionError> {
        match source {
            LibrarySource::File(path) => Ok(DescriptorSource::File(path.clone())),
            LibrarySource::Url(url) => Ok(DescriptorSource::Url(url.clone())),
            LibrarySource::Named {
                name,
                git_ref: Some(git_ref),
            } => Ok(DescriptorSource::GitRef {
                repository: self.repository.clone(),
                git_ref: git_ref.clone(),
                name: name.clone(),
            }),
            LibrarySource::Named {
                name,
                git_ref: None,
            } => match self.local_descriptor(name).await {
                Some(path) => Ok(DescriptorSource::Dir(path)),
                None => fallback.locate(name),
            },
        }
    }

    async fn local_descriptor(&self, name: &str) -> Option<PathBuf> {
        let path = self
            .local_libraries_dir
            .as_ref()?
            .join(format!("{name}.{DESCRIPTOR_EXTENSION}"));

        fs::metadata(&path).await.ok().map(|_| path)
    }

    async fn load(
        &mut self,
        source: DescriptorSource,
    ) -> Result<Arc<LibraryDescriptor>, ResolutionError> {
        if let Some(descriptor) = self.cache.get(&source) {
            debug!(%source, "library descriptor cache hit");
            return Ok(descriptor.clone());
        }

        let text = self.fetch_text(&source).await?;
        let descriptor = LibraryDescriptor::parse(&text).map_err(|e| {
            ResolutionError::MalformedDescriptor {
                location: source.to_string(),
                source: e,
            }
        })?;

        info!(%source, "resolved library descriptor");
        let descriptor = Arc::new(descriptor);
        self.cache.insert(source, descriptor.clone());

        Ok(descriptor)
    }

    async fn fetch_text(&self, source: &DescriptorSource) -> Result<String, ResolutionError> {
        match source {
            DescriptorSource::Dir(path) | DescriptorSource::File(path) => read_descriptor(path).await,
            DescriptorSource::GitRef {
                repository,
                git_ref,
                name,
            } => {
                let url = repository.descriptor_url(git_ref, name)?;
                self.fetcher.fetch(&url).await
            }
            DescriptorSource::Url(url) if url.scheme() == "file" => {
                let path = url.to_file_path().map_err(|_| ResolutionError::Fetch {
                    location: url.to_string(),
                    reason: "not a local file path".to_string(),
                })?;
                read_descriptor(&path).await
            }
            DescriptorSource::Url(url) => self.fetcher.fetch(url).await,
        }
    }
}

async fn read_descriptor(path: &Path) -> Result<String, ResolutionError> {
    fs::read_to_string(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ResolutionError::NotFound(path.display().to_string()),
        _ => ResolutionError::Io {
            path: path.to_path_buf(),
            source: e,
        },
    })
}
