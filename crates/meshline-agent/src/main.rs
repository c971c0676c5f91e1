use std::collections::HashMap;

use anyhow::{Context, bail};
use meshline_agent::{
    AgentConfig, AnimationRequest, RefineRequest, RetextureRequest, RiggingRequest,
    ServiceFactory, StageRequest, Text3dRequest,
};
use meshline_task::{ServiceKind, TaskId};

const USAGE: &str = "\
usage: meshline-agent <command> [args]

commands:
  text3d <entity> --prompt <text> [--art-style <s>] [--negative-prompt <text>] [--seed <n>] [--no-pbr] [--no-remesh]
  refine <entity> --preview-task <task_id>
  rig <entity> --model-id <task_id>
  animate <entity> --model-id <task_id> --animation-id <id>
  retexture <entity> --model-id <task_id> --prompt <text> [--art-style <s>] [--resolution <px>] [--seed <n>]
  pending <entity>
  find <task_id> [--entity <entity>]";

#[derive(Debug, Default)]
struct Args {
    positional: Vec<String>,
    flags: HashMap<String, String>,
    switches: Vec<String>,
}

const SWITCHES: &[&str] = &["help", "no-pbr", "no-remesh"];

impl Args {
    fn parse(raw: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        let mut args = Self::default();
        let mut iter = raw.into_iter();
        while let Some(arg) = iter.next() {
            let Some(name) = arg.strip_prefix("--") else {
                args.positional.push(arg);
                continue;
            };
            if SWITCHES.contains(&name) {
                args.switches.push(name.to_string());
                continue;
            }
            let value = iter
                .next()
                .with_context(|| format!("--{name} expects a value"))?;
            args.flags.insert(name.to_string(), value);
        }
        Ok(args)
    }

    fn positional(&self, idx: usize, what: &str) -> anyhow::Result<&str> {
        self.positional
            .get(idx)
            .map(String::as_str)
            .with_context(|| format!("missing <{what}>\n\n{USAGE}"))
    }

    fn flag(&self, name: &str) -> Option<&str> {
        self.flags.get(name).map(String::as_str)
    }

    fn required(&self, name: &str) -> anyhow::Result<&str> {
        self.flag(name)
            .with_context(|| format!("missing --{name}\n\n{USAGE}"))
    }

    fn switch(&self, name: &str) -> bool {
        self.switches.iter().any(|s| s == name)
    }

    fn seed(&self) -> anyhow::Result<Option<i64>> {
        self.flag("seed")
            .map(|v| v.parse::<i64>().context("--seed must be an integer"))
            .transpose()
    }
}

async fn submit<R: StageRequest>(
    factory: &ServiceFactory,
    entity: &str,
    service: ServiceKind,
    request: R,
) -> anyhow::Result<serde_json::Value> {
    if factory.client().config().api_key.is_none() {
        bail!("MESHY_API_KEY is not set");
    }
    let callback_url = factory.webhook_url(entity, service)?;
    let submission = factory
        .submissions()
        .submit_task(entity, request, &callback_url)
        .await
        .with_context(|| format!("submit {service} task for {entity}"))?;
    Ok(serde_json::to_value(&submission)?)
}

async fn run(factory: &ServiceFactory, args: &Args) -> anyhow::Result<serde_json::Value> {
    let command = args.positional(0, "command")?;
    match command {
        "text3d" => {
            let entity = args.positional(1, "entity")?;
            let mut request = Text3dRequest::new(args.required("prompt")?);
            if let Some(style) = args.flag("art-style") {
                request.art_style = style.to_string();
            }
            if let Some(negative) = args.flag("negative-prompt") {
                request.negative_prompt = negative.to_string();
            }
            request.enable_pbr = !args.switch("no-pbr");
            request.enable_retexture = !args.switch("no-remesh");
            request.seed = args.seed()?;
            submit(factory, entity, ServiceKind::Text3d, request).await
        }
        "refine" => {
            let entity = args.positional(1, "entity")?;
            let request = RefineRequest {
                preview_task_id: TaskId::from(args.required("preview-task")?),
            };
            submit(factory, entity, ServiceKind::Refine, request).await
        }
        "rig" => {
            let entity = args.positional(1, "entity")?;
            let request = RiggingRequest {
                model_id: args.required("model-id")?.to_string(),
            };
            submit(factory, entity, ServiceKind::Rigging, request).await
        }
        "animate" => {
            let entity = args.positional(1, "entity")?;
            let request = AnimationRequest {
                model_id: args.required("model-id")?.to_string(),
                animation_id: args.required("animation-id")?.to_string(),
            };
            submit(factory, entity, ServiceKind::Animation, request).await
        }
        "retexture" => {
            let entity = args.positional(1, "entity")?;
            let mut request =
                RetextureRequest::new(args.required("model-id")?, args.required("prompt")?);
            if let Some(style) = args.flag("art-style") {
                request.art_style = style.to_string();
            }
            if let Some(resolution) = args.flag("resolution") {
                request.resolution = resolution.to_string();
            }
            request.seed = args.seed()?;
            submit(factory, entity, ServiceKind::Retexture, request).await
        }
        "pending" => {
            let entity = args.positional(1, "entity")?;
            let pending = factory.repository().list_pending(entity).await?;
            Ok(serde_json::to_value(&pending)?)
        }
        "find" => {
            let task_id = TaskId::from(args.positional(1, "task_id")?);
            let found = factory
                .repository()
                .find_by_task_id(&task_id, args.flag("entity"))
                .await?;
            Ok(match found {
                Some(loc) => serde_json::json!({
                    "entity": loc.entity,
                    "spec_hash": loc.spec_hash,
                    "asset": loc.asset,
                }),
                None => serde_json::Value::Null,
            })
        }
        other => bail!("unknown command {other:?}\n\n{USAGE}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse(std::env::args().skip(1))?;
    if args.positional.is_empty() || args.switch("help") {
        println!("{USAGE}");
        return Ok(());
    }

    let config = AgentConfig::from_env();
    let factory = ServiceFactory::from_config(&config)
        .await
        .context("initialize services")?;

    let output = run(&factory, &args).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
