//! Provisioner facade: one entry point per outbound operation.
//!
//! Every call resolves a cluster client through the membership records and
//! delegates to the services. Read-only calls treat a missing cluster as
//! "nothing there" rather than an error.

use std::fmt::Write as _;

use convoy_common::{LabelSet, ObjectKind, ProcessState, Unit, UnitStatus, keys};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::application::ports::{
    AppRegistry, BackendConnector, CredentialStore, ImageStore, InstanceBackend,
    MembershipStore, NodeBackend, ServiceBackend, Stdio,
};
use crate::application::services::membership::{AddNodeRequest, UpdateNodeRequest};
use crate::application::services::{cluster, exec, membership, reconciler, runner, translator};
use crate::domain::commands::{
    archive_deploy_command, parse_procfile, procfile_command, run_command, shell_command,
    upload_deploy_command,
};
use crate::domain::net::{app_network_name, split_image, url_to_host, with_latest_tag};
use crate::domain::{
    AppInfo, BackendError, BackendKind, BackendResultExt, EngineConfig, ImageMetadata,
    MultiError, Node, PoolFilter, ProvisionError, ServiceSpec, SidecarConfig, SpecRequest,
    Task, TaskFilter, TtySize, app_selector, build_sidecar_spec, build_spec, service_name,
    sidecar_service_name,
};

/// Interactive shell into one unit of an app.
pub struct ShellRequest<'a> {
    /// Container ID or prefix; the first running unit when `None`.
    pub unit: Option<&'a str>,
    pub term: &'a str,
    pub size: Option<TtySize>,
    pub stdio: Stdio<'a>,
}

/// The cluster-backend provisioner.
pub struct Provisioner<C, A, I, K, M> {
    config: EngineConfig,
    connector: C,
    apps: A,
    images: I,
    credentials: K,
    members: M,
}

impl<C, A, I, K, M> Provisioner<C, A, I, K, M>
where
    C: BackendConnector,
    A: AppRegistry,
    I: ImageStore,
    K: CredentialStore,
    M: MembershipStore,
{
    pub fn new(
        config: EngineConfig,
        connector: C,
        apps: A,
        images: I,
        credentials: K,
        members: M,
    ) -> Self {
        Self {
            config,
            connector,
            apps,
            images,
            credentials,
            members,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn client(&self) -> Result<C::Backend, ProvisionError> {
        cluster::cluster_client(&self.connector, &self.members).await
    }

    /// `None` when no cluster is configured.
    async fn optional_client(&self) -> Result<Option<C::Backend>, ProvisionError> {
        match self.client().await {
            Ok(client) => Ok(Some(client)),
            Err(ProvisionError::BackendUnavailable) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn current_image(&self, app: &AppInfo) -> Result<(String, ImageMetadata), ProvisionError> {
        let image = self
            .images
            .current_image(&app.name)
            .await?
            .ok_or_else(|| ProvisionError::NotFound {
                kind: "deployed image",
                name: app.name.clone(),
            })?;
        let meta = self.images.image_metadata(&image).await?;
        Ok((image, meta))
    }

    // ── App lifecycle ─────────────────────────────────────────────────────────

    /// Create the app's overlay network.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` without a cluster, `Transport` otherwise.
    pub async fn provision(&self, app: &AppInfo) -> Result<(), ProvisionError> {
        let client = self.client().await?;
        let network = app_network_name(&app.name);
        client
            .create_network(&network)
            .await
            .op("create network", &network)?;
        tracing::info!(app = %app.name, network = %network, "app provisioned");
        Ok(())
    }

    /// Remove every process service of the app, then its network.
    ///
    /// # Errors
    ///
    /// Returns every failure once all removals were attempted.
    pub async fn destroy(&self, app: &AppInfo) -> Result<(), ProvisionError> {
        let client = self.client().await?;
        let mut errors = MultiError::new();
        match self.images.current_image(&app.name).await {
            Ok(Some(image)) => match self.images.image_metadata(&image).await {
                Ok(meta) => {
                    for process in meta.processes.keys() {
                        if let Err(e) = reconciler::remove(&client, &app.name, process).await {
                            errors.push(e);
                        }
                    }
                }
                Err(e) => errors.push(e.into()),
            },
            Ok(None) => {}
            Err(e) => errors.push(e.into()),
        }
        let network = app_network_name(&app.name);
        match client.remove_network(&network).await {
            Ok(()) | Err(BackendError::NotFound) => {}
            Err(source) => errors.push(ProvisionError::Transport {
                operation: "remove network",
                object: network.clone(),
                source,
            }),
        }
        errors.into_result()
    }

    // ── Units ─────────────────────────────────────────────────────────────────

    /// Scale `process` up by `n`. An empty process means every process.
    ///
    /// # Errors
    ///
    /// Returns the per-process failures.
    pub async fn add_units(&self, app: &AppInfo, n: u64, process: &str) -> Result<(), ProvisionError> {
        let increment = unit_count(n)?;
        self.change_units(app, process, ProcessState::scale(increment))
            .await
    }

    /// Scale `process` down by `n`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidScale` when fewer than `n` units are recorded.
    pub async fn remove_units(
        &self,
        app: &AppInfo,
        n: u64,
        process: &str,
    ) -> Result<(), ProvisionError> {
        let increment = unit_count(n)?;
        self.change_units(app, process, ProcessState::scale(-increment))
            .await
    }

    /// # Errors
    ///
    /// Returns the per-process failures.
    pub async fn start(&self, app: &AppInfo, process: &str) -> Result<(), ProvisionError> {
        self.change_units(app, process, ProcessState::start()).await
    }

    /// # Errors
    ///
    /// Returns the per-process failures.
    pub async fn stop(&self, app: &AppInfo, process: &str) -> Result<(), ProvisionError> {
        self.change_units(app, process, ProcessState::stop()).await
    }

    /// # Errors
    ///
    /// Returns the per-process failures.
    pub async fn restart(&self, app: &AppInfo, process: &str) -> Result<(), ProvisionError> {
        self.change_units(app, process, ProcessState::restart()).await
    }

    /// # Errors
    ///
    /// Returns the per-process failures.
    pub async fn sleep(&self, app: &AppInfo, process: &str) -> Result<(), ProvisionError> {
        self.change_units(app, process, ProcessState::sleep()).await
    }

    async fn change_units(
        &self,
        app: &AppInfo,
        process: &str,
        state: ProcessState,
    ) -> Result<(), ProvisionError> {
        let (image, meta) = self.current_image(app).await?;
        let client = self.client().await?;
        let processes: Vec<&str> = if process.is_empty() {
            meta.processes.keys().map(String::as_str).collect()
        } else {
            vec![process]
        };
        reconciler::deploy_each(&client, &self.config, app, &image, &meta, &processes, state).await
    }

    /// Units of the app. Empty without a cluster.
    ///
    /// # Errors
    ///
    /// Returns `Transport` when listing or lookups fail.
    pub async fn units(&self, app: &AppInfo) -> Result<Vec<Unit>, ProvisionError> {
        let Some(client) = self.optional_client().await? else {
            return Ok(Vec::new());
        };
        let tasks = client
            .list_tasks(&TaskFilter::with_labels(app_selector(&app.name)))
            .await
            .op("list tasks", &app.name)?;
        translator::tasks_to_units(&client, &self.apps, &tasks).await
    }

    /// `http://host:port` for every pool node, when the web process
    /// publishes a port.
    ///
    /// # Errors
    ///
    /// Returns `Transport` when lookups fail.
    pub async fn routable_addresses(&self, app: &AppInfo) -> Result<Vec<String>, ProvisionError> {
        let Some(image) = self.images.current_image(&app.name).await? else {
            return Ok(Vec::new());
        };
        let meta = self.images.image_metadata(&image).await?;
        let Some(web) = meta.web_process() else {
            return Ok(Vec::new());
        };
        let Some(client) = self.optional_client().await? else {
            return Ok(Vec::new());
        };
        let name = service_name(&app.name, web, ObjectKind::Service);
        let Some(port) = reconciler::find_service(&client, &name)
            .await?
            .and_then(|s| s.published_port)
        else {
            return Ok(Vec::new());
        };
        let nodes = membership::list_valid_nodes(&client).await?;
        Ok(nodes
            .iter()
            .filter(|n| app.pool.is_empty() || n.pool() == Some(app.pool.as_str()))
            .filter_map(|n| n.address.as_deref())
            .map(|addr| format!("http://{}:{port}", url_to_host(addr)))
            .collect())
    }

    /// Bind a unit that called home to its app. Build units instead persist
    /// `custom_data` for the image they are producing.
    ///
    /// # Errors
    ///
    /// Returns `UnitNotFound` when no task matches `instance_id`.
    pub async fn register_unit(
        &self,
        app: &AppInfo,
        instance_id: &str,
        custom_data: Option<&serde_json::Value>,
    ) -> Result<(), ProvisionError> {
        let client = self.client().await?;
        let selector: LabelSet = [(keys::APP_NAME, app.name.as_str())].into_iter().collect();
        let tasks = client
            .list_tasks(&TaskFilter::with_labels(selector))
            .await
            .op("list tasks", &app.name)?;
        let task = translator::find_task_by_container_id(&tasks, instance_id)
            .ok_or_else(|| ProvisionError::UnitNotFound(instance_id.to_string()))?;
        if task.labels.is_build() {
            if let (Some(data), Some(image)) = (custom_data, task.labels.build_image()) {
                self.images.save_custom_data(image, data).await?;
            }
            return Ok(());
        }
        let units =
            translator::tasks_to_units(&client, &self.apps, std::slice::from_ref(task)).await?;
        let unit = units
            .first()
            .ok_or_else(|| ProvisionError::UnitNotFound(instance_id.to_string()))?;
        self.apps.bind_unit(&app.name, unit).await?;
        Ok(())
    }

    // ── Deploys ───────────────────────────────────────────────────────────────

    /// Build the app from an archive URL on its platform image and roll the
    /// result out. Returns the new image name.
    ///
    /// # Errors
    ///
    /// Returns the build failure (non-zero exit carries the code) or any
    /// commit, push or rollout failure.
    pub async fn archive_deploy(
        &self,
        app: &AppInfo,
        archive_url: &str,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<String, ProvisionError> {
        self.build_and_deploy(app, archive_deploy_command(archive_url), Stdio::output(out))
            .await
    }

    /// Like [`Self::archive_deploy`], streaming the archive into the build
    /// instead of downloading it.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` when `build` is set.
    pub async fn upload_deploy(
        &self,
        app: &AppInfo,
        archive: &mut (dyn AsyncRead + Unpin + Send),
        build: bool,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<String, ProvisionError> {
        if build {
            return Err(ProvisionError::Unsupported {
                operation: "upload deploy with image build",
                backend: self.config.backend.name(),
            });
        }
        let stdio = Stdio {
            stdin: Some(archive),
            stdout: out,
            stderr: None,
        };
        self.build_and_deploy(app, upload_deploy_command(), stdio)
            .await
    }

    async fn build_and_deploy(
        &self,
        app: &AppInfo,
        command: Vec<String>,
        stdio: Stdio<'_>,
    ) -> Result<String, ProvisionError> {
        let client = self.client().await?;
        let base = self.images.platform_image(&app.platform).await?;
        let new_image = self.images.new_image_name(&app.name).await?;
        let spec = self.ephemeral_spec(app, &base, ObjectKind::Build, command, Some(&new_image))?;

        let outcome = self.run_once(&client, spec, stdio).await;
        let built = match outcome.result {
            Ok(run) => self.commit_build(&client, &run.task, &new_image).await,
            Err(e) => Err(e),
        };
        runner::cleanup(&client, outcome.service_id.as_deref()).await;
        built?;

        self.deploy_image(&client, app, &new_image).await?;
        Ok(new_image)
    }

    /// Deploy a prebuilt image: read its Procfile, retag it under the app's
    /// next image name, then roll it out. Returns the new image name.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSpec` when the image declares no process, and any
    /// run, tag, push or rollout failure.
    pub async fn image_deploy(
        &self,
        app: &AppInfo,
        image: &str,
        out: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<String, ProvisionError> {
        let image = with_latest_tag(image);
        let client = self.client().await?;
        write_progress(out, "---- Getting processes from image ----").await;

        let mut procfile = Vec::new();
        let spec = self.ephemeral_spec(app, &image, ObjectKind::Build, procfile_command(), None)?;
        let outcome = self.run_once(&client, spec, Stdio::output(&mut procfile)).await;
        runner::cleanup(&client, outcome.service_id.as_deref()).await;
        let run = outcome.result?;

        let processes = parse_procfile(&String::from_utf8_lossy(&procfile));
        if processes.is_empty() {
            return Err(ProvisionError::InvalidSpec(format!(
                "no processes declared in the Procfile of {image}"
            )));
        }
        for (name, cmd) in &processes {
            write_progress(out, &format!("    {name}: {cmd}")).await;
        }

        let new_image = self.images.new_image_name(&app.name).await?;
        let node = runner::task_node(&self.connector, &client, &run.task).await?;
        let (repo, tag) = split_image(&new_image);
        node.tag_image(&image, repo, tag)
            .await
            .op("tag image", &image)?;
        if let Some(auth) = self.config.registry_auth() {
            write_progress(out, "---- Pushing image to registry ----").await;
            node.push_image(repo, tag, Some(&auth))
                .await
                .op("push image", &new_image)?;
        }

        let meta = ImageMetadata {
            processes,
            healthcheck: None,
        };
        self.images.save_image_metadata(&new_image, &meta).await?;
        self.apps.set_update_platform(&app.name, true).await?;
        self.deploy_image(&client, app, &new_image).await?;
        Ok(new_image)
    }

    async fn deploy_image(
        &self,
        client: &C::Backend,
        app: &AppInfo,
        image: &str,
    ) -> Result<(), ProvisionError> {
        let previous = match self.images.current_image(&app.name).await? {
            Some(current) if current != image => Some(self.images.image_metadata(&current).await?),
            _ => None,
        };
        let meta = self.images.image_metadata(image).await?;
        reconciler::deploy_processes(client, &self.config, app, image, &meta, previous.as_ref())
            .await
    }

    async fn commit_build(
        &self,
        client: &C::Backend,
        task: &Task,
        image: &str,
    ) -> Result<(), ProvisionError> {
        let node = runner::task_node(&self.connector, client, task).await?;
        runner::commit_push_build_image(&node, task, image, self.config.registry_auth().as_ref())
            .await
    }

    fn ephemeral_spec(
        &self,
        app: &AppInfo,
        image: &str,
        kind: ObjectKind,
        command: Vec<String>,
        build_image: Option<&str>,
    ) -> Result<ServiceSpec, ProvisionError> {
        build_spec(
            &SpecRequest {
                app,
                process: "",
                image,
                kind,
                state: ProcessState::default(),
                command,
                healthcheck: None,
                build_image,
            },
            None,
            &self.config,
        )
    }

    async fn run_once(
        &self,
        client: &C::Backend,
        spec: ServiceSpec,
        stdio: Stdio<'_>,
    ) -> runner::RunOutcome {
        runner::run_once(
            &self.connector,
            client,
            spec,
            stdio,
            self.config.task_wait(),
            self.config.attach_inspect_interval(),
        )
        .await
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    async fn running_tasks(
        &self,
        client: &C::Backend,
        app: &AppInfo,
    ) -> Result<Vec<Task>, ProvisionError> {
        let tasks = client
            .list_tasks(&TaskFilter::with_labels(app_selector(&app.name)))
            .await
            .op("list tasks", &app.name)?;
        Ok(tasks
            .into_iter()
            .filter(|t| t.state.unit_status() == UnitStatus::Started && !t.container_id.is_empty())
            .collect())
    }

    /// Run a command in every running unit, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns `EmptyApp` without running units and `TaskFailed` for the
    /// first non-zero exit.
    pub async fn execute_command(
        &self,
        app: &AppInfo,
        mut stdio: Stdio<'_>,
        cmd: &str,
        args: &[String],
    ) -> Result<(), ProvisionError> {
        let client = self.client().await?;
        let tasks = self.running_tasks(&client, app).await?;
        if tasks.is_empty() {
            return Err(ProvisionError::EmptyApp(app.name.clone()));
        }
        for task in &tasks {
            let node = runner::task_node(&self.connector, &client, task).await?;
            let req = exec::ExecRequest {
                cmd: run_command(cmd, args),
                tty: false,
                size: None,
                stdio: stdio.reborrow(),
            };
            exec::exec_checked(&node, task, req).await?;
        }
        Ok(())
    }

    /// Run a command in one running unit.
    ///
    /// # Errors
    ///
    /// Returns `EmptyApp` without running units and `TaskFailed` on
    /// non-zero exit.
    pub async fn execute_command_once(
        &self,
        app: &AppInfo,
        stdio: Stdio<'_>,
        cmd: &str,
        args: &[String],
    ) -> Result<(), ProvisionError> {
        let client = self.client().await?;
        let tasks = self.running_tasks(&client, app).await?;
        let task = tasks
            .first()
            .ok_or_else(|| ProvisionError::EmptyApp(app.name.clone()))?;
        let node = runner::task_node(&self.connector, &client, task).await?;
        let req = exec::ExecRequest {
            cmd: run_command(cmd, args),
            tty: false,
            size: None,
            stdio,
        };
        exec::exec_checked(&node, task, req).await
    }

    /// Run a command in a fresh instance of the app's current image.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an app that was never deployed and
    /// `TaskFailed` on non-zero exit.
    pub async fn execute_command_isolated(
        &self,
        app: &AppInfo,
        stdio: Stdio<'_>,
        cmd: &str,
        args: &[String],
    ) -> Result<(), ProvisionError> {
        if app.deploys == 0 {
            return Err(ProvisionError::NotFound {
                kind: "deployed image",
                name: app.name.clone(),
            });
        }
        let (image, _) = self.current_image(app).await?;
        let client = self.client().await?;
        let spec = self.ephemeral_spec(
            app,
            &image,
            ObjectKind::IsolatedRun,
            run_command(cmd, args),
            None,
        )?;
        let outcome = self.run_once(&client, spec, stdio).await;
        runner::cleanup(&client, outcome.service_id.as_deref()).await;
        outcome.result.map(|_| ())
    }

    /// Interactive shell in one unit.
    ///
    /// # Errors
    ///
    /// Returns `UnitNotFound` for an unknown unit and `EmptyApp` when
    /// nothing runs.
    pub async fn shell(&self, app: &AppInfo, req: ShellRequest<'_>) -> Result<(), ProvisionError> {
        let client = self.client().await?;
        let tasks = self.running_tasks(&client, app).await?;
        let task = match req.unit {
            Some(unit) => translator::find_task_by_container_id(&tasks, unit)
                .ok_or_else(|| ProvisionError::UnitNotFound(unit.to_string()))?,
            None => tasks
                .first()
                .ok_or_else(|| ProvisionError::EmptyApp(app.name.clone()))?,
        };
        let node = runner::task_node(&self.connector, &client, task).await?;
        let exit_code = exec::exec_in_task(
            &node,
            task,
            exec::ExecRequest {
                cmd: shell_command(req.term),
                tty: true,
                size: req.size,
                stdio: req.stdio,
            },
        )
        .await?;
        tracing::debug!(app = %app.name, unit = %task.container_id, exit_code, "shell closed");
        Ok(())
    }

    // ── Nodes ─────────────────────────────────────────────────────────────────

    /// Add a node. On Kubernetes only the cluster API endpoint can be added,
    /// flagged with `cluster=true` metadata.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` for plain Kubernetes nodes, otherwise any
    /// membership failure.
    pub async fn add_node(&self, req: &AddNodeRequest) -> Result<(), ProvisionError> {
        match self.config.backend {
            BackendKind::Swarm => {
                membership::add_node(
                    &self.connector,
                    &self.credentials,
                    &self.members,
                    &self.config,
                    req,
                )
                .await
            }
            BackendKind::Kubernetes if req.metadata.get("cluster").map(String::as_str) == Some("true") => {
                membership::register_cluster_endpoint(
                    &self.connector,
                    &self.credentials,
                    &self.members,
                    &self.config,
                    req,
                )
                .await
            }
            BackendKind::Kubernetes => Err(ProvisionError::Unsupported {
                operation: "add node",
                backend: BackendKind::Kubernetes.name(),
            }),
        }
    }

    /// # Errors
    ///
    /// Returns `NotFound` for an unknown address and the first eviction
    /// failure when rebalancing.
    pub async fn remove_node(&self, address: &str, rebalance: bool) -> Result<(), ProvisionError> {
        let client = self.client().await?;
        membership::remove_node(&self.connector, &client, &self.members, address, rebalance).await
    }

    /// # Errors
    ///
    /// Returns `NotFound` for an unknown address and `Conflict` on a
    /// concurrent node change.
    pub async fn update_node(&self, req: &UpdateNodeRequest) -> Result<(), ProvisionError> {
        let client = self.client().await?;
        membership::update_node(&client, req).await
    }

    /// Valid nodes, optionally only those at `addresses`. Empty without a
    /// cluster.
    ///
    /// # Errors
    ///
    /// Returns `Transport` when listing fails.
    pub async fn list_nodes(&self, addresses: &[String]) -> Result<Vec<Node>, ProvisionError> {
        let Some(client) = self.optional_client().await? else {
            return Ok(Vec::new());
        };
        let nodes = membership::list_valid_nodes(&client).await?;
        Ok(nodes
            .into_iter()
            .filter(|n| {
                addresses.is_empty()
                    || n.address.as_ref().is_some_and(|a| addresses.contains(a))
            })
            .collect())
    }

    /// # Errors
    ///
    /// Returns `NotFound` when no valid node has that address.
    pub async fn get_node(&self, address: &str) -> Result<Node, ProvisionError> {
        let Some(client) = self.optional_client().await? else {
            return Err(ProvisionError::NotFound {
                kind: "node",
                name: address.to_string(),
            });
        };
        membership::find_node(&client, address).await
    }

    /// Node hosting any of `instance_ids`, else the first known node among
    /// `addresses`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when neither matches.
    pub async fn node_for_instances(
        &self,
        instance_ids: &[String],
        addresses: &[String],
    ) -> Result<Node, ProvisionError> {
        let client = self.client().await?;
        if !instance_ids.is_empty() {
            let tasks = client
                .list_tasks(&TaskFilter::default())
                .await
                .op("list tasks", "cluster")?;
            let found = instance_ids
                .iter()
                .find_map(|id| translator::find_task_by_container_id(&tasks, id));
            if let Some(task) = found {
                return client
                    .inspect_node(&task.node_id)
                    .await
                    .op("inspect node", &task.node_id);
            }
        }
        for address in addresses {
            match membership::find_node(&client, address).await {
                Ok(node) => return Ok(node),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Err(ProvisionError::NotFound {
            kind: "node",
            name: addresses.join(", "),
        })
    }

    // ── Sidecars ──────────────────────────────────────────────────────────────

    /// Create or update a sidecar in every pool scope of `filter`. A no-op
    /// without a cluster.
    ///
    /// # Errors
    ///
    /// Returns every per-scope failure once all scopes were attempted.
    pub async fn upgrade_sidecar(
        &self,
        sidecar: &SidecarConfig,
        filter: &PoolFilter,
        placement_only: bool,
    ) -> Result<(), ProvisionError> {
        let Some(client) = self.optional_client().await? else {
            return Ok(());
        };
        let mut errors = MultiError::new();
        for pool in filter.scopes() {
            let spec = build_sidecar_spec(sidecar, pool, filter)?;
            if let Err(e) = reconciler::upsert_spec(&client, &spec, placement_only).await {
                errors.push(e);
            }
        }
        errors.into_result()
    }

    /// # Errors
    ///
    /// Returns `Transport` for failures other than not-found.
    pub async fn remove_sidecar(&self, name: &str, pool: &str) -> Result<(), ProvisionError> {
        let Some(client) = self.optional_client().await? else {
            return Ok(());
        };
        reconciler::remove_by_name(&client, &sidecar_service_name(name, pool)).await
    }

    // ── Startup ───────────────────────────────────────────────────────────────

    /// Human-readable node summary.
    ///
    /// # Errors
    ///
    /// Returns `Transport` when listing fails.
    pub async fn startup_message(&self) -> Result<String, ProvisionError> {
        let nodes = self.list_nodes(&[]).await?;
        let mut msg = format!(
            "{} provisioner reports the following nodes:\n",
            self.config.backend.name()
        );
        if nodes.is_empty() {
            msg.push_str("    No node available.\n");
        }
        for node in &nodes {
            let role = node.spec.role.map_or_else(|| "-".to_string(), |r| r.to_string());
            let _ = writeln!(
                msg,
                "    Node: {} [{}] [{}]",
                node.address.as_deref().unwrap_or_default(),
                node.status,
                role
            );
        }
        Ok(msg)
    }
}

fn unit_count(n: u64) -> Result<i64, ProvisionError> {
    i64::try_from(n).map_err(|_| ProvisionError::InvalidSpec(format!("unit count {n} out of range")))
}

async fn write_progress(out: &mut (dyn AsyncWrite + Unpin + Send), line: &str) {
    let line = format!("{line}\n");
    if let Err(e) = out.write_all(line.as_bytes()).await {
        tracing::debug!(error = %e, "cannot write deploy progress");
    }
}
