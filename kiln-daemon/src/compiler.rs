// SPDX-License-Identifier: MIT

//! Compiler dispatch: the seam between the server and the actual compiler
//! front ends.
//!
//! The server never inspects what a compiler does. It asks the dispatch for
//! a runnable job, optionally checks that the request's analyzer set is
//! still loadable, runs the job, and forwards the result.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use kiln_protocol::{CompletedResponse, RunRequest};

/// One runnable compilation. Produced per request, consumed by running it.
pub trait CompilerJob: Send + 'static {
    /// Whether the analyzer set referenced by the request is loadable and
    /// consistent with what this server instance has in memory. A failing
    /// check short-circuits execution with the analyzer-inconsistency
    /// sentinel response.
    fn analyzers_consistent(&self) -> bool {
        true
    }

    /// Run the compilation. The token is cancelled when the client
    /// disconnects before the result is wanted; the job may finish early
    /// with whatever result it likes, it will be discarded.
    fn run(self, cancel: CancellationToken) -> impl Future<Output = CompletedResponse> + Send;
}

/// Resolves a request's declared language to a runnable compiler, or
/// reports that the language is unknown. Cloned into every connection task.
pub trait CompilerDispatch: Clone + Send + Sync + 'static {
    type Job: CompilerJob;

    fn try_create(&self, request: &RunRequest) -> Option<Self::Job>;
}

type BoxedRunFuture = Pin<Box<dyn Future<Output = CompletedResponse> + Send>>;
type Factory = Arc<dyn Fn(&RunRequest) -> RegisteredJob + Send + Sync>;

/// A language-name → compiler-factory map, the dispatch the hosting
/// executable normally uses. An empty registry answers every request with
/// the unknown-language sentinel.
#[derive(Clone, Default)]
pub struct CompilerRegistry {
    factories: HashMap<String, Factory>,
}

impl CompilerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a compiler front end for `language`. The factory is called
    /// once per request.
    pub fn register<F>(&mut self, language: impl Into<String>, factory: F)
    where
        F: Fn(&RunRequest) -> RegisteredJob + Send + Sync + 'static,
    {
        self.factories.insert(language.into(), Arc::new(factory));
    }
}

impl CompilerDispatch for CompilerRegistry {
    type Job = RegisteredJob;

    fn try_create(&self, request: &RunRequest) -> Option<RegisteredJob> {
        self.factories
            .get(&request.language)
            .map(|factory| factory(request))
    }
}

/// A job produced by a [`CompilerRegistry`] factory.
pub struct RegisteredJob {
    analyzers_consistent: bool,
    run: Box<dyn FnOnce(CancellationToken) -> BoxedRunFuture + Send>,
}

impl RegisteredJob {
    pub fn new<F, Fut>(run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = CompletedResponse> + Send + 'static,
    {
        Self::with_analyzer_check(true, run)
    }

    pub fn with_analyzer_check<F, Fut>(analyzers_consistent: bool, run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = CompletedResponse> + Send + 'static,
    {
        Self {
            analyzers_consistent,
            run: Box::new(move |cancel| Box::pin(run(cancel))),
        }
    }
}

impl CompilerJob for RegisteredJob {
    fn analyzers_consistent(&self) -> bool {
        self.analyzers_consistent
    }

    fn run(self, cancel: CancellationToken) -> impl Future<Output = CompletedResponse> + Send {
        (self.run)(cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(language: &str) -> RunRequest {
        RunRequest {
            language: language.into(),
            working_directory: String::new(),
            lib_directory: String::new(),
            arguments: vec![],
        }
    }

    #[tokio::test]
    async fn registry_resolves_registered_language() {
        let mut registry = CompilerRegistry::new();
        registry.register("rustc", |_request| {
            RegisteredJob::new(|_cancel| async {
                CompletedResponse {
                    exit_code: 0,
                    utf8_output: true,
                    output: "done".into(),
                    error_output: String::new(),
                }
            })
        });

        let job = registry.try_create(&request("rustc")).unwrap();
        assert!(job.analyzers_consistent());
        let response = job.run(CancellationToken::new()).await;
        assert_eq!(response.exit_code, 0);
        assert_eq!(response.output, "done");
    }

    #[test]
    fn registry_reports_unknown_language() {
        let registry = CompilerRegistry::new();
        assert!(registry.try_create(&request("Z")).is_none());
    }
}
