//! Docker Swarm backend over the Engine API.
//!
//! `SwarmConnector` opens one bollard client per node address, with mutual
//! TLS when credentials are stored for that address. Swarm membership,
//! node and task calls go through raw Engine API requests on a reqwest
//! client sharing the same TLS identity.

mod convert;
mod engine;
mod errors;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use bollard::auth::DockerCredentials;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, InspectContainerOptions, LogOutput,
    WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::image::{CommitContainerOptions, PushImageOptions, TagImageOptions};
use bollard::models::{Node as DockerNode, Swarm, SwarmInitRequest, Task as DockerTask};
use bollard::network::CreateNetworkOptions;
use bollard::service::UpdateServiceOptions;
use bollard::{API_DEFAULT_VERSION, Docker};
use futures::{Stream, StreamExt};
use reqwest::Method;
use serde_json::json;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::application::ports::{
    BackendConnector, ClusterInit, ClusterJoin, CredentialStore, ExecBackend, InstanceBackend,
    MembershipBackend, NodeBackend, ServiceBackend, Stdio,
};
use crate::domain::{
    BackendError, EngineConfig, ExecStatus, InstanceState, Node, NodeSpec, ProvisionError,
    RegistryAuth, ServiceObject, ServiceSpec, Task, TaskFilter, TtySize, VersionToken,
};
use crate::infra::tls::{self, TlsFiles};

use engine::EngineHttp;
use errors::{classify, is_conflict_status};

/// Opens [`SwarmBackend`] clients.
pub struct SwarmConnector<K> {
    credentials: K,
    dial_timeout: Duration,
    full_timeout: Duration,
    registry: Option<RegistryAuth>,
}

impl<K: CredentialStore> SwarmConnector<K> {
    pub fn new(config: &EngineConfig, credentials: K) -> Self {
        Self {
            credentials,
            dial_timeout: config.dial_timeout(),
            full_timeout: config.full_timeout(),
            registry: config.registry_auth(),
        }
    }
}

impl<K: CredentialStore> BackendConnector for SwarmConnector<K> {
    type Backend = SwarmBackend;

    async fn connect(&self, address: &str) -> Result<SwarmBackend, ProvisionError> {
        let creds = self.credentials.node_credentials(address).await?;
        let timeout_secs = self.full_timeout.as_secs();
        let mut http = reqwest::Client::builder()
            .connect_timeout(self.dial_timeout)
            .timeout(self.full_timeout);
        let (docker, tls_files) = match &creds {
            Some(creds) => {
                let files = tls::write_files(creds).map_err(|e| connect_error(address, e))?;
                let docker = Docker::connect_with_ssl(
                    address,
                    &files.key(),
                    &files.cert(),
                    &files.ca(),
                    timeout_secs,
                    API_DEFAULT_VERSION,
                )
                .map_err(|e| connect_error(address, e.into()))?;
                http = tls::configure_reqwest(http, creds).map_err(|e| connect_error(address, e))?;
                (docker, Some(files))
            }
            None => {
                let docker = Docker::connect_with_http(address, timeout_secs, API_DEFAULT_VERSION)
                    .map_err(|e| connect_error(address, e.into()))?;
                (docker, None)
            }
        };
        let http = http
            .build()
            .context("building engine HTTP client")
            .map_err(|e| connect_error(address, e))?;
        tracing::debug!(node = %address, tls = tls_files.is_some(), "engine client ready");
        Ok(SwarmBackend {
            docker,
            engine: EngineHttp::new(http, engine::base_url(address, tls_files.is_some())),
            address: address.to_string(),
            registry: self.registry.as_ref().map(credentials_for),
            _tls: tls_files,
        })
    }
}

fn connect_error(address: &str, source: anyhow::Error) -> ProvisionError {
    ProvisionError::Transport {
        operation: "connect",
        object: address.to_string(),
        source: BackendError::Api(source),
    }
}

fn credentials_for(auth: &RegistryAuth) -> DockerCredentials {
    DockerCredentials {
        username: auth.username.clone(),
        password: auth.password.clone(),
        email: auth.email.clone(),
        serveraddress: Some(auth.address.clone()),
        ..Default::default()
    }
}

/// Client bound to one node of a swarm.
pub struct SwarmBackend {
    docker: Docker,
    engine: EngineHttp,
    address: String,
    registry: Option<DockerCredentials>,
    /// Keeps the PEM files bollard reads alive for the client's lifetime.
    _tls: Option<TlsFiles>,
}

fn version_index(version: &VersionToken) -> Result<u64, BackendError> {
    version
        .as_str()
        .parse()
        .map_err(|_| BackendError::Api(anyhow::anyhow!("invalid version index {:?}", version.0)))
}

fn io_error(e: std::io::Error) -> BackendError {
    BackendError::Api(anyhow::Error::new(e).context("streaming instance I/O"))
}

/// Copy stdin into the session and its output into the caller's writers
/// until both sides close.
async fn pump<S, W>(output: S, mut input: W, stdio: Stdio<'_>) -> Result<(), BackendError>
where
    S: Stream<Item = Result<LogOutput, bollard::errors::Error>> + Unpin,
    W: AsyncWrite + Unpin,
{
    let Stdio {
        stdin,
        stdout,
        mut stderr,
    } = stdio;

    let feed = async {
        if let Some(stdin) = stdin {
            tokio::io::copy(stdin, &mut input).await.map_err(io_error)?;
            input.shutdown().await.map_err(io_error)?;
        }
        Ok::<(), BackendError>(())
    };

    let drain = async {
        let mut output = output;
        while let Some(chunk) = output.next().await {
            match chunk.map_err(classify)? {
                LogOutput::StdErr { message } => match stderr.as_deref_mut() {
                    Some(err) => err.write_all(&message).await.map_err(io_error)?,
                    None => stdout.write_all(&message).await.map_err(io_error)?,
                },
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    stdout.write_all(&message).await.map_err(io_error)?;
                }
                LogOutput::StdIn { .. } => {}
            }
        }
        stdout.flush().await.map_err(io_error)?;
        Ok::<(), BackendError>(())
    };

    let (fed, drained) = tokio::join!(feed, drain);
    fed.and(drained)
}

impl ServiceBackend for SwarmBackend {
    async fn create_service(&self, spec: &ServiceSpec) -> Result<String, BackendError> {
        let created = self
            .docker
            .create_service(convert::to_docker_spec(spec), self.registry.clone())
            .await
            .map_err(classify)?;
        created
            .id
            .ok_or_else(|| BackendError::Api(anyhow::anyhow!("manager returned no service ID")))
    }

    async fn update_service(
        &self,
        id: &str,
        version: &VersionToken,
        spec: &ServiceSpec,
    ) -> Result<(), BackendError> {
        let options = UpdateServiceOptions {
            version: version_index(version)?,
            ..Default::default()
        };
        self.docker
            .update_service(id, convert::to_docker_spec(spec), options, self.registry.clone())
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn inspect_service(&self, name_or_id: &str) -> Result<ServiceObject, BackendError> {
        let service = self
            .docker
            .inspect_service(name_or_id, None)
            .await
            .map_err(classify)?;
        Ok(convert::from_docker_service(service))
    }

    async fn remove_service(&self, name_or_id: &str) -> Result<(), BackendError> {
        self.docker
            .delete_service(name_or_id)
            .await
            .map_err(classify)
    }

    async fn create_network(&self, name: &str) -> Result<(), BackendError> {
        let options = CreateNetworkOptions {
            name,
            driver: "overlay",
            check_duplicate: true,
            attachable: true,
            ..Default::default()
        };
        match self.docker.create_network(options).await {
            Ok(_) => Ok(()),
            Err(e) if is_conflict_status(&e) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    async fn remove_network(&self, name: &str) -> Result<(), BackendError> {
        self.docker.remove_network(name).await.map_err(classify)
    }
}

impl InstanceBackend for SwarmBackend {
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, BackendError> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        if let Some(service) = &filter.service {
            filters.insert("service".into(), vec![service.clone()]);
        }
        if let Some(node) = &filter.node {
            filters.insert("node".into(), vec![node.clone()]);
        }
        if !filter.labels.is_empty() {
            filters.insert(
                "label".into(),
                filter.labels.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            );
        }
        let req = self
            .engine
            .request(Method::GET, "/tasks")
            .query(&[("filters", json!(filters).to_string())]);
        let tasks: Vec<DockerTask> = EngineHttp::json(req).await?;
        Ok(tasks.into_iter().map(convert::from_docker_task).collect())
    }

    async fn inspect_instance(&self, task: &Task) -> Result<InstanceState, BackendError> {
        let container = self
            .docker
            .inspect_container(&task.container_id, None::<InspectContainerOptions>)
            .await
            .map_err(classify)?;
        let state = container.state.unwrap_or_default();
        Ok(InstanceState {
            running: state.running.unwrap_or(false),
            exit_code: state.exit_code.unwrap_or(0),
        })
    }

    async fn attach_instance(&self, task: &Task, stdio: Stdio<'_>) -> Result<(), BackendError> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(stdio.stdin.is_some()),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            ..Default::default()
        };
        let AttachContainerResults { output, input } = self
            .docker
            .attach_container(&task.container_id, Some(options))
            .await
            .map_err(classify)?;
        pump(output, input, stdio).await
    }

    async fn wait_instance(&self, task: &Task) -> Result<i64, BackendError> {
        let mut stream = self
            .docker
            .wait_container(&task.container_id, None::<WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(exit)) => Ok(exit.status_code),
            // bollard reports non-zero exits as errors.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(classify(e)),
            None => Err(BackendError::Api(anyhow::anyhow!(
                "wait stream for {} closed without a status",
                task.container_id
            ))),
        }
    }

    async fn commit_instance(&self, task: &Task, repo: &str, tag: &str) -> Result<(), BackendError> {
        let options = CommitContainerOptions {
            container: task.container_id.as_str(),
            repo,
            tag,
            pause: true,
            ..Default::default()
        };
        self.docker
            .commit_container(options, Config::<String>::default())
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn tag_image(&self, source: &str, repo: &str, tag: &str) -> Result<(), BackendError> {
        self.docker
            .tag_image(source, Some(TagImageOptions { repo, tag }))
            .await
            .map_err(classify)
    }

    async fn push_image(
        &self,
        repo: &str,
        tag: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), BackendError> {
        let mut progress =
            self.docker
                .push_image(repo, Some(PushImageOptions { tag }), auth.map(credentials_for));
        while let Some(info) = progress.next().await {
            if let Some(error) = info.map_err(classify)?.error {
                return Err(BackendError::Api(anyhow::anyhow!(
                    "pushing {repo}:{tag}: {error}"
                )));
            }
        }
        Ok(())
    }
}

impl NodeBackend for SwarmBackend {
    async fn list_nodes(&self) -> Result<Vec<Node>, BackendError> {
        let nodes: Vec<DockerNode> =
            EngineHttp::json(self.engine.request(Method::GET, "/nodes")).await?;
        Ok(nodes.into_iter().map(convert::from_docker_node).collect())
    }

    async fn inspect_node(&self, id: &str) -> Result<Node, BackendError> {
        let node: DockerNode =
            EngineHttp::json(self.engine.request(Method::GET, &format!("/nodes/{id}"))).await?;
        Ok(convert::from_docker_node(node))
    }

    async fn update_node(
        &self,
        id: &str,
        version: &VersionToken,
        spec: &NodeSpec,
    ) -> Result<(), BackendError> {
        let req = self
            .engine
            .request(Method::POST, &format!("/nodes/{id}/update"))
            .query(&[("version", version_index(version)?)])
            .json(&convert::to_docker_node_spec(spec));
        EngineHttp::call(req).await
    }

    async fn remove_node(&self, id: &str, force: bool) -> Result<(), BackendError> {
        let req = self
            .engine
            .request(Method::DELETE, &format!("/nodes/{id}"))
            .query(&[("force", force)]);
        EngineHttp::call(req).await
    }

    async fn evict_instance(&self, task: &Task) -> Result<(), BackendError> {
        // Draining already makes the manager reschedule every task.
        tracing::debug!(task = %task.id, "swarm reschedules drained tasks");
        Ok(())
    }
}

impl MembershipBackend for SwarmBackend {
    fn endpoint(&self) -> &str {
        &self.address
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.docker.ping().await.map_err(classify)?;
        Ok(())
    }

    async fn init_cluster(&self, req: &ClusterInit) -> Result<(), BackendError> {
        let body = SwarmInitRequest {
            listen_addr: Some(req.listen_addr.clone()),
            advertise_addr: Some(req.advertise_addr.clone()),
            ..Default::default()
        };
        EngineHttp::call(self.engine.request(Method::POST, "/swarm/init").json(&body)).await
    }

    async fn join_token(&self) -> Result<String, BackendError> {
        let swarm: Swarm = EngineHttp::json(self.engine.request(Method::GET, "/swarm")).await?;
        swarm
            .join_tokens
            .and_then(|t| t.worker)
            .ok_or_else(|| BackendError::Api(anyhow::anyhow!("swarm reported no worker join token")))
    }

    async fn manager_peers(&self) -> Result<Vec<String>, BackendError> {
        let info = self.docker.info().await.map_err(classify)?;
        Ok(info
            .swarm
            .and_then(|s| s.remote_managers)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|peer| peer.addr)
            .collect())
    }

    async fn join_cluster(&self, req: &ClusterJoin) -> Result<(), BackendError> {
        let body = json!({
            "ListenAddr": req.listen_addr,
            "AdvertiseAddr": req.advertise_addr,
            "RemoteAddrs": req.remote_addrs,
            "JoinToken": req.join_token,
        });
        EngineHttp::call(self.engine.request(Method::POST, "/swarm/join").json(&body)).await
    }

    async fn local_node_id(&self) -> Result<String, BackendError> {
        let info = self.docker.info().await.map_err(classify)?;
        info.swarm
            .and_then(|s| s.node_id)
            .filter(|id| !id.is_empty())
            .ok_or(BackendError::NotFound)
    }

    async fn leave_cluster(&self, force: bool) -> Result<(), BackendError> {
        let req = self
            .engine
            .request(Method::POST, "/swarm/leave")
            .query(&[("force", force)]);
        EngineHttp::call(req).await
    }
}

impl ExecBackend for SwarmBackend {
    async fn create_exec(
        &self,
        task: &Task,
        cmd: &[String],
        tty: bool,
        attach_stdin: bool,
    ) -> Result<String, BackendError> {
        let options = CreateExecOptions {
            attach_stdin: Some(attach_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(tty),
            cmd: Some(cmd.to_vec()),
            ..Default::default()
        };
        let created = self
            .docker
            .create_exec(&task.container_id, options)
            .await
            .map_err(classify)?;
        Ok(created.id)
    }

    async fn start_exec(&self, exec_id: &str, tty: bool, stdio: Stdio<'_>) -> Result<(), BackendError> {
        let options = StartExecOptions {
            detach: false,
            tty,
            ..Default::default()
        };
        match self
            .docker
            .start_exec(exec_id, Some(options))
            .await
            .map_err(classify)?
        {
            StartExecResults::Attached { output, input } => pump(output, input, stdio).await,
            StartExecResults::Detached => Ok(()),
        }
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecStatus, BackendError> {
        let exec = self.docker.inspect_exec(exec_id).await.map_err(classify)?;
        Ok(ExecStatus {
            running: exec.running.unwrap_or(false),
            exit_code: exec.exit_code,
        })
    }

    async fn resize_exec(&self, exec_id: &str, size: TtySize) -> Result<(), BackendError> {
        self.docker
            .resize_exec(
                exec_id,
                ResizeExecOptions {
                    height: size.height,
                    width: size.width,
                },
            )
            .await
            .map_err(classify)
    }
}
