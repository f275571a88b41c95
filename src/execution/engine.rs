//! Workflow Execution Engine
//!
//! Drives one job from PENDING to FINISHED or ERROR:
//! - loads the job, its workflow and apps from the store
//! - creates the job's work and output directories
//! - builds and initializes the workflow graph
//! - walks the graph in topological order, staging inputs and running
//!   steps until each settles
//!
//! A job runs on the calling thread. Parallelism across jobs comes from
//! running one engine per job.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use log::{debug, error, info, warn};
use serde::Serialize;

use super::registry::ContextRegistry;
use super::step::{JobScope, StepStatus, WorkflowStep};
use crate::config::EngineConfig;
use crate::error::{EngineError, StepError};
use crate::logging::LogContext;
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::slug::slugify;
use crate::store::JobStore;
use crate::uri::Uri;
use crate::workflow::graph::{GraphSpec, NodeUnit, WorkflowGraph};
use crate::workflow::model::{JobDef, Status};
use crate::workflow::parser::{check_apps, new_id};
use crate::workflow::validator::validate_workflow;

/// Status summary of a job.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub id: String,
    pub name: String,
    pub status: Status,
}

/// Locations owned by one job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUris {
    /// Work location per data context
    pub work: BTreeMap<String, Uri>,
    pub output: Option<Uri>,
}

/// Job execution driver.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use pipeflow::config::EngineConfig;
/// use pipeflow::execution::{ContextRegistry, Engine};
/// use pipeflow::store::LocalStore;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = EngineConfig::default();
///     let registry = Arc::new(ContextRegistry::with_local(&config));
///     let store = Arc::new(LocalStore::new());
///     // store.add_workflow(...); store.add_job(...)?;
///
///     let mut engine = Engine::new("0123456789abcdef", store, registry, config);
///     engine.initialize()?;
///     engine.run()?;
///     Ok(())
/// }
/// ```
pub struct Engine {
    job_id: String,
    store: Arc<dyn JobStore>,
    registry: Arc<ContextRegistry>,
    config: EngineConfig,
    log: LogContext,
    job: Option<JobDef>,
    graph: Option<WorkflowGraph>,
    status: Status,
    timeline: ExecutionTimeline,
}

impl Engine {
    pub fn new(
        job_id: impl Into<String>,
        store: Arc<dyn JobStore>,
        registry: Arc<ContextRegistry>,
        config: EngineConfig,
    ) -> Self {
        let job_id = job_id.into();
        let log = LogContext::new("job").child(job_id.get(..8).unwrap_or(&job_id));
        Self {
            job_id,
            store,
            registry,
            config,
            log,
            job: None,
            graph: None,
            status: Status::Pending,
            timeline: ExecutionTimeline::new(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn graph(&self) -> Option<&WorkflowGraph> {
        self.graph.as_ref()
    }

    pub fn timeline(&self) -> &ExecutionTimeline {
        &self.timeline
    }

    /// Loads definitions, creates the job directories and builds the graph.
    ///
    /// Any failure leaves the job in ERROR.
    pub fn initialize(&mut self) -> Result<(), EngineError> {
        let result = self.try_initialize();
        self.guard(result)
    }

    fn try_initialize(&mut self) -> Result<(), EngineError> {
        let job = self.store.get_job_def(&self.job_id)?;
        let mut workflow = self.store.get_workflow_def(&job.workflow_id)?;
        let apps = self.store.get_app_defs_for_workflow(&job.workflow_id)?;
        self.job = Some(job.clone());

        info!(
            target: self.log.target(),
            "Initializing job '{}' of workflow '{}'",
            job.name,
            workflow.name
        );

        workflow.apply_job(&job);
        for step in workflow.steps.values_mut() {
            if step.step_id.is_empty() {
                step.step_id = new_id();
            }
        }
        validate_workflow(&mut workflow)?;
        check_apps(&workflow, &apps)?;

        let uris = self.create_job_uris(&job)?;

        let scope = JobScope {
            job_id: self.job_id.clone(),
            registry: self.registry.clone(),
            store: self.store.clone(),
            log: self.log.clone(),
        };
        let layout = GraphSpec {
            workflow: &workflow,
            apps: &apps,
            work_uris: &uris.work,
            output_uri: uris.output.as_ref(),
            config: &self.config,
        };
        self.graph = Some(WorkflowGraph::build(layout, &scope)?);
        Ok(())
    }

    /// Derives the job's locations from its base locations.
    ///
    /// The job directory is `<slug(name)>-<short id>`. With
    /// `no_output_hash` the output directory is `<slug(name)>` only.
    pub fn job_uris(job: &JobDef) -> Result<JobUris, EngineError> {
        let name = slugify(&job.name);
        let job_dir = format!("{}-{}", name, job.short_id());

        let mut work = BTreeMap::new();
        for (context, base) in &job.work_uri {
            work.insert(context.clone(), Uri::parse(base)?.join(&job_dir)?);
        }

        let output = match job.output_uri.trim() {
            "" => None,
            base => {
                let folder = if job.no_output_hash { &name } else { &job_dir };
                Some(Uri::parse(base)?.join(folder)?)
            }
        };

        Ok(JobUris { work, output })
    }

    fn create_job_uris(&self, job: &JobDef) -> Result<JobUris, EngineError> {
        let uris = Self::job_uris(job)?;
        for uri in uris.work.values().chain(uris.output.iter()) {
            debug!(target: self.log.target(), "Creating job directory {}", uri);
            self.registry
                .mkdir(uri, true)
                .map_err(|source| EngineError::JobDirectory {
                    uri: uri.to_string(),
                    source,
                })?;
        }
        Ok(uris)
    }

    /// Runs every node in topological order.
    ///
    /// Stops at the first failing node; the job ends in ERROR with that
    /// node's message, FINISHED otherwise.
    pub fn run(&mut self) -> Result<(), EngineError> {
        let Some(mut graph) = self.graph.take() else {
            return self.guard(Err(EngineError::NotInitialized));
        };

        self.update_status(Status::Running, "");
        self.mark_started();

        let result = self.walk(&mut graph);
        self.graph = Some(graph);
        self.guard(result)?;

        info!(
            target: self.log.target(),
            "Job finished in {:.2?}",
            self.timeline.elapsed()
        );
        self.update_status(Status::Finished, "");
        self.mark_finished();
        self.log_notifications();
        Ok(())
    }

    fn walk(&mut self, graph: &mut WorkflowGraph) -> Result<(), EngineError> {
        for key in graph.order().to_vec() {
            let Some(node) = graph.node_mut(&key) else {
                continue;
            };

            info!(target: self.log.target(), "Processing {}", key);
            self.timeline.add_event(key.clone(), EventType::Started);

            let outcome = match node.unit_mut() {
                Some(NodeUnit::Input(input)) => {
                    input.stage(&self.registry).map_err(StepError::from)
                }
                Some(NodeUnit::Step(step)) => self.run_step(step),
                None => Err(StepError::NotInitialized),
            };

            match outcome {
                Ok(()) => self.timeline.add_event(key, EventType::Completed),
                Err(source) => {
                    self.timeline.add_event(key.clone(), EventType::Failed);
                    return Err(EngineError::Node { node: key, source });
                }
            }
        }
        Ok(())
    }

    /// Expands, launches and polls one step until every item settles.
    fn run_step(&self, step: &mut WorkflowStep) -> Result<(), StepError> {
        step.iterate_map_uri()?;
        step.run()?;

        let delay = self.config.poll_delay();
        loop {
            step.check_running_jobs();
            if step.all_done() {
                if !step.any_failed() {
                    break;
                }
                step.retry_failed()?;
            }
            thread::sleep(delay);
        }

        step.clean_up()?;
        step.stage()
    }

    pub fn status_struct(&self) -> EngineStatus {
        EngineStatus {
            id: self.job_id.get(..8).unwrap_or(&self.job_id).to_string(),
            name: self
                .job
                .as_ref()
                .map(|job| job.name.clone())
                .unwrap_or_default(),
            status: self.status,
        }
    }

    /// Step summaries in topological order.
    pub fn step_statuses(&self) -> Vec<StepStatus> {
        self.graph
            .iter()
            .flat_map(|graph| graph.steps())
            .map(WorkflowStep::status_struct)
            .collect()
    }

    fn log_notifications(&self) {
        let Some(job) = &self.job else {
            return;
        };
        for notification in &job.notifications {
            debug!(
                target: self.log.target(),
                "Notification delivery not configured; skipping {} {:?}",
                notification.url,
                notification.to
            );
        }
    }

    fn update_status(&mut self, status: Status, msg: &str) {
        self.status = status;
        if let Err(e) = self.store.update_job_status(&self.job_id, status, msg) {
            warn!(target: self.log.target(), "Cannot update job status: {}", e);
        }
    }

    fn mark_started(&self) {
        if let Err(e) = self.store.set_job_started(&self.job_id) {
            warn!(target: self.log.target(), "Cannot record job start: {}", e);
        }
    }

    fn mark_finished(&self) {
        if let Err(e) = self.store.set_job_finished(&self.job_id) {
            warn!(target: self.log.target(), "Cannot record job end: {}", e);
        }
    }

    /// Persists ERROR with the message of `err` and hands the error back.
    fn fail(&mut self, err: EngineError) -> EngineError {
        error!(target: self.log.target(), "Job failed: {}", err);
        self.update_status(Status::Error, &err.to_string());
        self.mark_started();
        self.mark_finished();
        err
    }

    fn guard<T>(&mut self, result: Result<T, EngineError>) -> Result<T, EngineError> {
        result.map_err(|e| self.fail(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DefinitionError, GraphError};
    use crate::execution::backend::ItemStatus;
    use crate::execution::retry::RetryPolicy;
    use crate::execution::testing::{MemoryData, MemoryTransfer, ScriptedExecutor};
    use crate::store::LocalStore;
    use crate::workflow::model::{AppDef, StepDef, WorkflowDef};
    use std::fs;
    use tempfile::tempdir;

    const JOB_ID: &str = "0123456789abcdef";

    fn job() -> JobDef {
        let mut job = JobDef::new(JOB_ID, "Test Job");
        job.workflow_id = "wf-1".to_string();
        job
    }

    fn scripted_job() -> JobDef {
        job()
            .with_work_uri("mem", "mem:/work")
            .with_output_uri("mem:/out")
            .with_step_context("default", "grid")
    }

    fn store_with(mut workflow: WorkflowDef, apps: &[&str], job: JobDef) -> Arc<LocalStore> {
        workflow.workflow_id = "wf-1".to_string();
        let apps = apps
            .iter()
            .map(|name| (name.to_string(), AppDef::new(*name)))
            .collect();
        let store = Arc::new(LocalStore::new());
        store.add_workflow(workflow, apps);
        store.add_job(job).unwrap();
        store
    }

    struct Scripted {
        mem: Arc<MemoryData>,
        exec: Arc<ScriptedExecutor>,
        store: Arc<LocalStore>,
        engine: Engine,
    }

    fn scripted<F>(workflow: WorkflowDef, build: F) -> Scripted
    where
        F: FnOnce(Arc<MemoryData>) -> ScriptedExecutor,
    {
        let mem = Arc::new(MemoryData::new("mem"));
        let exec = Arc::new(build(mem.clone()));
        let mut registry = ContextRegistry::new();
        registry.register_data(mem.clone());
        registry.register_exec(exec.clone());
        registry.set_policy("mem", RetryPolicy::once());

        let store = store_with(workflow, &["app"], scripted_job());
        let config = EngineConfig::default().with_poll_delay(0);
        let engine = Engine::new(JOB_ID, store.clone(), Arc::new(registry), config);
        Scripted {
            mem,
            exec,
            store,
            engine,
        }
    }

    fn single_step() -> WorkflowDef {
        WorkflowDef::new("wf").with_step(StepDef::new("s1", "app").with_template("output", "out.txt"))
    }

    fn job_status(store: &LocalStore) -> Status {
        store.job_record(JOB_ID).unwrap().status
    }

    #[test]
    fn test_job_uris() {
        let job = job()
            .with_work_uri("local", "/scratch/work")
            .with_output_uri("/results");
        let uris = Engine::job_uris(&job).unwrap();
        assert_eq!(uris.work["local"].to_string(), "local:/scratch/work/test-job-01234567");
        assert_eq!(uris.output.unwrap().to_string(), "local:/results/test-job-01234567");

        let mut job = job;
        job.no_output_hash = true;
        let uris = Engine::job_uris(&job).unwrap();
        assert_eq!(uris.output.unwrap().to_string(), "local:/results/test-job");

        job.output_uri = String::new();
        assert!(Engine::job_uris(&job).unwrap().output.is_none());
    }

    #[test]
    fn test_local_step_produces_output() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        fs::create_dir_all(&data).unwrap();
        fs::write(data.join("in.txt"), "reads").unwrap();

        let script = dir.path().join("app.sh");
        fs::write(
            &script,
            "for arg in \"$@\"; do\n  case $arg in --output=*) out=\"${arg#--output=}\";; esac\ndone\necho done > \"$out\"\n",
        )
        .unwrap();

        let workflow = WorkflowDef::new("wf")
            .with_input("reads", format!("local:{}", data.join("in.txt").display()))
            .with_step(StepDef::new("s1", "app").with_template("output", "out.txt"));
        let mut workflow = workflow;
        workflow.workflow_id = "wf-1".to_string();
        let apps = BTreeMap::from([(
            "app".to_string(),
            AppDef::new("app").with_script(format!("bash {}", script.display())),
        )]);
        let store = Arc::new(LocalStore::new());
        store.add_workflow(workflow, apps);
        store
            .add_job(job().with_work_uri("local", dir.path().join("work").display().to_string()))
            .unwrap();

        let config = EngineConfig::default().with_poll_delay(0);
        let registry = Arc::new(ContextRegistry::with_local(&config));
        let mut engine = Engine::new(JOB_ID, store.clone(), registry, config);
        engine.initialize().unwrap();
        engine.run().unwrap();

        let step_dir = dir.path().join("work/test-job-01234567/s1");
        assert!(step_dir.join("out.txt").exists());
        assert!(step_dir.join("_log").is_dir());

        let statuses = engine.step_statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].map.keys().collect::<Vec<_>>(), vec!["root"]);
        assert_eq!(engine.status(), Status::Finished);
        assert_eq!(job_status(&store), Status::Finished);

        let record = store.job_record(JOB_ID).unwrap();
        assert!(record.started.is_some());
        assert!(record.finished.is_some());
        let step = record.steps.values().next().unwrap();
        assert_eq!(step.status, Status::Finished);
    }

    #[test]
    fn test_mapped_step_fans_out_over_parent_output() {
        let workflow = WorkflowDef::new("wf")
            .with_step(StepDef::new("s1", "app").with_template("output", "out"))
            .with_step(
                StepDef::new("s2", "app")
                    .depends_on("s1")
                    .with_map("{s1->output}", r"^(.*)\.txt$")
                    .with_template("input", "{s1->output}/{1}.txt")
                    .with_template("output", "{1}.done"),
            );
        let mut fx = scripted(workflow, |mem| {
            ScriptedExecutor::new("grid", "mem").producing("s1", &["x.txt", "y.txt"], mem)
        });

        fx.engine.initialize().unwrap();
        fx.engine.run().unwrap();

        let graph = fx.engine.graph().unwrap();
        let s2 = graph.node("step.s2").and_then(|n| n.step()).unwrap();
        let names: Vec<&str> = s2.items().iter().map(|i| i.filename.as_str()).collect();
        assert_eq!(names, vec!["x.txt", "y.txt"]);
        assert_eq!(
            s2.items()[0].template["input"],
            "mem:/work/test-job-01234567/s1/x.txt"
        );
        assert_eq!(s2.items()[1].template["output"], "y.done");

        let launched: Vec<(String, String)> = fx
            .exec
            .launches()
            .into_iter()
            .map(|(step, item, _)| (step, item))
            .collect();
        assert_eq!(
            launched,
            vec![
                ("s1".to_string(), "root".to_string()),
                ("s2".to_string(), "x.txt".to_string()),
                ("s2".to_string(), "y.txt".to_string()),
            ]
        );
        assert_eq!(job_status(&fx.store), Status::Finished);
    }

    #[test]
    fn test_unknown_parameter_fails_before_launch() {
        let workflow = WorkflowDef::new("wf").with_step(
            StepDef::new("s1", "app")
                .with_template("x", "{workflow->nonexistent_param}")
                .with_template("output", "out"),
        );
        let mut fx = scripted(workflow, |_| ScriptedExecutor::new("grid", "mem"));

        let err = fx.engine.initialize().unwrap_err();
        assert!(matches!(
            err,
            EngineError::Graph(GraphError::Definition(DefinitionError::UnknownVariable { .. }))
        ));
        assert!(err.to_string().contains("nonexistent_param"));
        assert!(fx.exec.launches().is_empty());

        let record = fx.store.job_record(JOB_ID).unwrap();
        assert_eq!(record.status, Status::Error);
        assert!(record.msg.contains("nonexistent_param"));
        assert!(record.started.is_some());
        assert!(record.finished.is_some());
    }

    #[test]
    fn test_cycle_fails_before_initialize() {
        let workflow = WorkflowDef::new("wf")
            .with_step(
                StepDef::new("a", "app")
                    .depends_on("b")
                    .with_template("output", "a"),
            )
            .with_step(
                StepDef::new("b", "app")
                    .depends_on("a")
                    .with_template("output", "b"),
            );
        let mut fx = scripted(workflow, |_| ScriptedExecutor::new("grid", "mem"));

        let err = fx.engine.initialize().unwrap_err();
        assert!(matches!(err, EngineError::Definition(DefinitionError::Cycle(_))));
        assert_eq!(fx.exec.validate_calls(), 0);
        assert!(!fx.mem.is_dir("/work/test-job-01234567/a"));
        assert_eq!(job_status(&fx.store), Status::Error);
    }

    #[test]
    fn test_retry_limit_bounds_attempts() {
        let mut fx = scripted(single_step(), |_| {
            ScriptedExecutor::new("grid", "mem")
                .with_retry_limit(2)
                .failing("root", 10)
        });

        fx.engine.initialize().unwrap();
        let err = fx.engine.run().unwrap_err();
        assert!(matches!(
            err,
            EngineError::Node {
                source: StepError::RetryExhausted { limit: 2, .. },
                ..
            }
        ));

        let attempts: Vec<u32> = fx.exec.launches().iter().map(|(_, _, a)| *a).collect();
        assert_eq!(attempts, vec![0, 1, 2]);
        assert_eq!(job_status(&fx.store), Status::Error);
        assert_eq!(fx.engine.timeline().failed_nodes(), vec!["step.s1"]);

        let step = fx.store.job_record(JOB_ID).unwrap().steps.into_values().next().unwrap();
        assert_eq!(step.status, Status::Error);
        assert_eq!(step.detail["root"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_failed_item_recovers_on_retry() {
        let mut fx = scripted(single_step(), |_| {
            ScriptedExecutor::new("grid", "mem")
                .with_retry_limit(1)
                .with_pending_polls(2)
                .failing("root", 1)
        });

        fx.engine.initialize().unwrap();
        fx.engine.run().unwrap();

        let attempts: Vec<u32> = fx.exec.launches().iter().map(|(_, _, a)| *a).collect();
        assert_eq!(attempts, vec![0, 1]);
        assert_eq!(fx.engine.status(), Status::Finished);
    }

    #[test]
    fn test_unknown_status_is_polled_until_settled() {
        let mut fx = scripted(single_step(), |_| {
            ScriptedExecutor::new("grid", "mem")
                .with_initial_status(ItemStatus::Unknown)
                .with_poll_errors(1)
                .with_unknown_polls(2)
        });

        fx.engine.initialize().unwrap();
        fx.engine.run().unwrap();

        assert_eq!(fx.exec.launches().len(), 1);
        assert_eq!(fx.engine.status(), Status::Finished);
        assert_eq!(job_status(&fx.store), Status::Finished);

        let step = fx.store.job_record(JOB_ID).unwrap().steps.into_values().next().unwrap();
        assert_eq!(step.status, Status::Finished);
        assert_eq!(step.detail["root"].as_array().unwrap().len(), 1);
        assert_eq!(step.detail["root"][0]["status"], "FINISHED");
    }

    #[test]
    fn test_final_output_staged_to_job_output() {
        let workflow = single_step().with_final_output("s1");
        let mut fx = scripted(workflow, |mem| {
            ScriptedExecutor::new("grid", "mem").producing("s1", &["out.txt"], mem)
        });

        fx.engine.initialize().unwrap();
        fx.engine.run().unwrap();

        assert!(fx.mem.is_file("/work/test-job-01234567/s1/out.txt"));
        assert!(fx.mem.is_file("/out/test-job-01234567/s1/out.txt"));
    }

    #[test]
    fn test_input_staged_into_step_context() {
        let workflow = WorkflowDef::new("wf")
            .with_input("reads", "far:/data/reads")
            .with_step(
                StepDef::new("s1", "app")
                    .with_map("{workflow->reads}", r"^(.*)\.fq$")
                    .with_template("output", "{1}.bam"),
            );
        let far = Arc::new(MemoryData::new("far"));
        far.touch("/data/reads/a.fq");
        far.touch("/data/reads/b.fq");

        let mem = Arc::new(MemoryData::new("mem"));
        let exec = Arc::new(ScriptedExecutor::new("grid", "mem"));
        let mut registry = ContextRegistry::new();
        registry.register_data(mem.clone());
        registry.register_data(far.clone());
        registry.register_exec(exec.clone());
        registry.register_transfer("far", "mem", Arc::new(MemoryTransfer::new(far, mem.clone())));

        let store = store_with(workflow, &["app"], scripted_job());
        let config = EngineConfig::default().with_poll_delay(0);
        let mut engine = Engine::new(JOB_ID, store, Arc::new(registry), config);
        engine.initialize().unwrap();
        engine.run().unwrap();

        assert!(mem.is_file("/work/test-job-01234567/_input-reads/reads/a.fq"));
        let items: Vec<String> = exec.launches().into_iter().map(|(_, item, _)| item).collect();
        assert_eq!(items, vec!["a.fq", "b.fq"]);
    }

    #[test]
    fn test_run_before_initialize() {
        let mut fx = scripted(single_step(), |_| ScriptedExecutor::new("grid", "mem"));
        assert!(matches!(fx.engine.run(), Err(EngineError::NotInitialized)));
        assert_eq!(fx.engine.status(), Status::Error);
    }

    #[test]
    fn test_status_struct() {
        let mut fx = scripted(single_step(), |_| ScriptedExecutor::new("grid", "mem"));
        fx.engine.initialize().unwrap();
        let status = fx.engine.status_struct();
        assert_eq!(status.id, "01234567");
        assert_eq!(status.name, "Test Job");
        assert_eq!(status.status, Status::Pending);
    }
}
