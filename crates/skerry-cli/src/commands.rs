//! Subcommands and their mapping onto client operations.

use crate::config::parse_key_value;
use anyhow::Context as _;
use clap::{Args, Subcommand};
use serde::Serialize;
use skerry_core::{
    Client, CodeRequest, CommandRequest, ContextId, CoreError, ExecutionResult, FileOpResult, SandboxConfig, SandboxId,
    WriteOptions, DEFAULT_TEMPLATE, MIN_SANDBOX_TIMEOUT_SECS,
};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Sandbox lifecycle
    #[command(subcommand)]
    Sandbox(SandboxCommand),
    /// Run code in a sandbox
    Code(CodeArgs),
    /// Run a shell command in a sandbox
    Run(RunArgs),
    /// File operations inside a sandbox
    #[command(subcommand)]
    File(FileCommand),
    /// Code contexts
    #[command(subcommand)]
    Context(ContextCommand),
    /// Template catalog
    #[command(subcommand)]
    Templates(TemplateCommand),
    /// Create a sandbox, run code in it, then kill it
    Exec(ExecArgs),
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    /// Template name or ID
    #[arg(long, default_value = DEFAULT_TEMPLATE)]
    pub template: String,
    /// Provider (overrides the client default)
    #[arg(long)]
    pub provider: Option<String>,
    /// Region (overrides the client default)
    #[arg(long)]
    pub region: Option<String>,
    /// Lifetime in seconds
    #[arg(long, default_value_t = MIN_SANDBOX_TIMEOUT_SECS)]
    pub timeout: u32,
    /// Environment variable, KEY=VALUE (repeatable)
    #[arg(long = "env", value_parser = parse_key_value)]
    pub env: Vec<(String, String)>,
    /// Metadata tag, KEY=VALUE (repeatable)
    #[arg(long = "meta", value_parser = parse_key_value)]
    pub metadata: Vec<(String, String)>,
}

impl CreateArgs {
    fn sandbox_config(&self) -> Result<SandboxConfig, CoreError> {
        let mut builder = SandboxConfig::builder()
            .template(self.template.clone())
            .timeout_secs(self.timeout);
        if let Some(provider) = &self.provider {
            builder = builder.provider(provider.clone());
        }
        if let Some(region) = &self.region {
            builder = builder.region(region.clone());
        }
        for (key, value) in &self.env {
            builder = builder.env(key.clone(), value.clone());
        }
        for (key, value) in &self.metadata {
            builder = builder.metadata(key.clone(), value.clone());
        }
        builder.build()
    }
}

#[derive(Debug, Subcommand)]
pub enum SandboxCommand {
    /// Create a sandbox
    Create(CreateArgs),
    /// List sandboxes
    List {
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        offset: Option<u32>,
    },
    /// Show one sandbox
    Get { id: String },
    /// Kill a sandbox (succeeds if it is already gone)
    Kill { id: String },
    /// Change a sandbox's lifetime
    Timeout { id: String, secs: u32 },
    /// Show resource usage
    Metrics { id: String },
    /// Public URL for an exposed port
    Host { id: String, port: u16 },
}

#[derive(Debug, Args)]
pub struct CodeArgs {
    /// Sandbox ID
    pub sandbox: String,
    /// Code to run
    pub code: String,
    /// Interpreter language
    #[arg(long, default_value = "python")]
    pub language: String,
    /// Run inside this code context
    #[arg(long)]
    pub context: Option<String>,
    /// Execution timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

impl CodeArgs {
    fn request(&self) -> CodeRequest {
        let mut request = CodeRequest::new(self.code.clone()).language(self.language.clone());
        if let Some(context) = &self.context {
            request = request.context(ContextId::from(context.as_str()));
        }
        if let Some(ms) = self.timeout_ms {
            request = request.timeout_ms(ms);
        }
        request
    }
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Sandbox ID
    pub sandbox: String,
    /// Working directory
    #[arg(long)]
    pub cwd: Option<String>,
    /// Environment variable, KEY=VALUE (repeatable)
    #[arg(long = "env", value_parser = parse_key_value)]
    pub env: Vec<(String, String)>,
    /// Execution timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,
    /// Command and its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum FileCommand {
    /// Print a text file
    Read { sandbox: String, path: String },
    /// Write a text file
    Write {
        sandbox: String,
        path: String,
        content: String,
        /// Owner of the file
        #[arg(long)]
        user: Option<String>,
        /// Permission bits in octal, e.g. 755
        #[arg(long, value_parser = parse_octal)]
        mode: Option<u32>,
    },
    /// List a directory
    List {
        sandbox: String,
        #[arg(default_value = ".")]
        path: String,
    },
    /// Delete a file or directory
    Delete { sandbox: String, path: String },
    /// Create a directory
    Mkdir { sandbox: String, path: String },
    /// Upload a local file
    Upload {
        sandbox: String,
        local: PathBuf,
        remote: Option<String>,
    },
    /// Download a file to a local path
    Download {
        sandbox: String,
        path: String,
        output: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
pub enum ContextCommand {
    /// Create a code context
    Create {
        sandbox: String,
        #[arg(long, default_value = "python")]
        language: String,
        #[arg(long)]
        cwd: Option<String>,
    },
    /// Show a code context
    Get { sandbox: String, context: String },
    /// Delete a code context
    Delete { sandbox: String, context: String },
}

#[derive(Debug, Subcommand)]
pub enum TemplateCommand {
    /// List templates
    List {
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        offset: Option<u32>,
    },
}

#[derive(Debug, Args)]
pub struct ExecArgs {
    #[command(flatten)]
    pub sandbox: CreateArgs,
    /// Code to run
    pub code: String,
    /// Interpreter language
    #[arg(long, default_value = "python")]
    pub language: String,
}

fn parse_octal(s: &str) -> Result<u32, String> {
    let digits = s.trim_start_matches("0o");
    u32::from_str_radix(digits, 8).map_err(|e| format!("invalid octal mode {s:?}: {e}"))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Exit status mirroring a finished command; 0-255 passes through.
fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

/// Run one subcommand and report its exit status.
pub async fn execute(client: &Client, command: Command) -> anyhow::Result<ExitCode> {
    match command {
        Command::Sandbox(cmd) => sandbox(client, cmd).await?,
        Command::Code(args) => {
            let id = SandboxId::from(args.sandbox.as_str());
            let result = client.dispatcher().run_code(&id, &args.request()).await?;
            let failed = result.is_error();
            print_json(&ExecutionResult::from(result))?;
            if failed {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Run(args) => {
            let id = SandboxId::from(args.sandbox.as_str());
            let (program, rest) = args
                .command
                .split_first()
                .context("a command is required")?;
            let mut request = CommandRequest::new(program.clone()).args(rest.iter().cloned());
            if let Some(cwd) = args.cwd {
                request = request.working_dir(cwd);
            }
            for (key, value) in args.env {
                request = request.env(key, value);
            }
            if let Some(ms) = args.timeout_ms {
                request = request.timeout_ms(ms);
            }
            let result = client.dispatcher().run_command(&id, &request).await?;
            let code = result.exit_code;
            print_json(&ExecutionResult::from(result))?;
            return Ok(ExitCode::from(exit_status(code)));
        }
        Command::File(cmd) => file(client, cmd).await?,
        Command::Context(cmd) => context(client, cmd).await?,
        Command::Templates(TemplateCommand::List { limit, offset }) => {
            print_json(&client.templates().list(limit, offset).await?)?;
        }
        Command::Exec(args) => {
            let config = args.sandbox.sandbox_config()?;
            let request = CodeRequest::new(args.code).language(args.language);
            let result = client
                .with_session(&config, |session| async move { session.run_code(&request).await })
                .await?;
            let failed = result.is_error();
            print_json(&ExecutionResult::from(result))?;
            if failed {
                return Ok(ExitCode::FAILURE);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn sandbox(client: &Client, command: SandboxCommand) -> anyhow::Result<()> {
    let sandboxes = client.sandboxes();
    match command {
        SandboxCommand::Create(args) => {
            let sandbox = sandboxes.create(&args.sandbox_config()?).await?;
            print_json(&sandbox)
        }
        SandboxCommand::List { limit, offset } => print_json(&sandboxes.list(limit, offset).await?),
        SandboxCommand::Get { id } => print_json(&sandboxes.get(&SandboxId::from(id)).await?),
        SandboxCommand::Kill { id } => {
            let removal = sandboxes.kill(&SandboxId::from(id.as_str())).await?;
            print_json(&serde_json::json!({ "sandbox_id": id, "outcome": removal }))
        }
        SandboxCommand::Timeout { id, secs } => {
            print_json(&sandboxes.set_timeout(&SandboxId::from(id), secs).await?)
        }
        SandboxCommand::Metrics { id } => print_json(&sandboxes.get_metrics(&SandboxId::from(id)).await?),
        SandboxCommand::Host { id, port } => {
            let url = sandboxes.get_host_url(&SandboxId::from(id), port).await?;
            print_json(&serde_json::json!({ "url": url }))
        }
    }
}

async fn file(client: &Client, command: FileCommand) -> anyhow::Result<()> {
    let files = client.dispatcher();
    let result = match command {
        FileCommand::Read { sandbox, path } => {
            FileOpResult::Read(files.read_file(&SandboxId::from(sandbox), &path).await?)
        }
        FileCommand::Write {
            sandbox,
            path,
            content,
            user,
            mode,
        } => {
            let id = SandboxId::from(sandbox);
            if user.is_none() && mode.is_none() {
                FileOpResult::Write(files.write_file(&id, &path, &content).await?)
            } else {
                let options = WriteOptions { user, mode };
                let written = files.write(&id, &path, content.into_bytes(), &options).await?;
                FileOpResult::WriteMultipart(skerry_core::WriteFilesResult {
                    files: vec![written],
                    partial_failure: false,
                })
            }
        }
        FileCommand::List { sandbox, path } => FileOpResult::List {
            files: files.list_files(&SandboxId::from(sandbox), &path).await?,
        },
        FileCommand::Delete { sandbox, path } => {
            FileOpResult::Delete(files.delete_file(&SandboxId::from(sandbox), &path).await?)
        }
        FileCommand::Mkdir { sandbox, path } => {
            FileOpResult::Mkdir(files.make_directory(&SandboxId::from(sandbox), &path).await?)
        }
        FileCommand::Upload { sandbox, local, remote } => FileOpResult::Upload(
            files
                .upload_file(&SandboxId::from(sandbox), &local, remote.as_deref())
                .await?,
        ),
        FileCommand::Download { sandbox, path, output } => {
            let data = files.download_file(&SandboxId::from(sandbox), &path).await?;
            tokio::fs::write(&output, &data)
                .await
                .with_context(|| format!("writing {}", output.display()))?;
            tracing::info!(path = %path, output = %output.display(), bytes = data.len(), "Downloaded");
            FileOpResult::Download {
                path,
                size: data.len(),
                data,
            }
        }
    };
    print_json(&ExecutionResult::from(result))
}

async fn context(client: &Client, command: ContextCommand) -> anyhow::Result<()> {
    let contexts = client.contexts();
    match command {
        ContextCommand::Create { sandbox, language, cwd } => print_json(
            &contexts
                .create_context(&SandboxId::from(sandbox), &language, cwd.as_deref())
                .await?,
        ),
        ContextCommand::Get { sandbox, context } => print_json(
            &contexts
                .get_context(&SandboxId::from(sandbox), &ContextId::from(context))
                .await?,
        ),
        ContextCommand::Delete { sandbox, context } => {
            let removal = contexts
                .delete_context(&SandboxId::from(sandbox), &ContextId::from(context.as_str()))
                .await?;
            print_json(&serde_json::json!({ "context_id": context, "outcome": removal }))
        }
    }
}
