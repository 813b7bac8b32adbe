//! Bulk export and import of instance data.
//!
//! Used to move instances between registrations by hand, since registrations
//! carry a single version and are never converted automatically.

use super::client::{ApiClient, collection_path};
use clap::Args;
use color_eyre::eyre::{Result, WrapErr, bail};
use registrar_crd::DynamicObject;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::{info, warn};

/// Identifies the resource collection to read from or write to
#[derive(Args, Debug)]
pub struct ResourceArgs {
    /// API group of the registered type
    #[arg(long)]
    pub group: String,

    /// Version of the registered type
    #[arg(long)]
    pub version: String,

    /// Plural resource name (e.g. widgets)
    #[arg(long)]
    pub resource: String,
}

#[derive(Args, Debug)]
pub struct ExportArgs {
    #[command(flatten)]
    pub target: ResourceArgs,

    /// Namespace to export from (required for namespaced types)
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Write to a file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ImportArgs {
    #[command(flatten)]
    pub target: ResourceArgs,

    /// YAML file produced by `registrar export`
    #[arg(short, long)]
    pub file: PathBuf,
}

#[derive(Debug, Deserialize)]
struct InstanceList {
    #[serde(default)]
    items: Vec<DynamicObject>,
}

/// Clear everything the server assigns so the object can be created anew.
/// `apiVersion` and `kind` are cleared too; the target type fills them in.
pub fn strip_server_metadata(object: &mut DynamicObject) {
    object.type_meta.api_version.clear();
    object.type_meta.kind.clear();
    let meta = &mut object.metadata;
    meta.uid = None;
    meta.resource_version = None;
    meta.generation = 0;
    meta.creation_timestamp = None;
    meta.deletion_timestamp = None;
    meta.finalizers.clear();
}

pub async fn export(client: &ApiClient, args: ExportArgs) -> Result<()> {
    let target = &args.target;
    let path = collection_path(
        &target.group,
        &target.version,
        &target.resource,
        args.namespace.as_deref(),
    );
    let list: InstanceList = client.get(&path).await?;
    let yaml = serde_yaml::to_string(&list.items).wrap_err("failed to render instances")?;

    match &args.output {
        Some(file) => {
            std::fs::write(file, yaml)
                .wrap_err_with(|| format!("failed to write {}", file.display()))?;
            info!(count = list.items.len(), file = %file.display(), "Exported instances");
        }
        None => print!("{}", yaml),
    }
    Ok(())
}

pub async fn import(client: &ApiClient, args: ImportArgs) -> Result<()> {
    let source = std::fs::read_to_string(&args.file)
        .wrap_err_with(|| format!("failed to read {}", args.file.display()))?;
    let objects: Vec<DynamicObject> = serde_yaml::from_str(&source)
        .wrap_err_with(|| format!("{} is not an instance export", args.file.display()))?;

    let target = &args.target;
    let mut failed = 0usize;
    for mut object in objects.iter().cloned() {
        strip_server_metadata(&mut object);
        let path = collection_path(
            &target.group,
            &target.version,
            &target.resource,
            object.namespace(),
        );
        match client.post::<_, DynamicObject>(&path, &object).await {
            Ok(created) => info!(name = %created.name(), namespace = ?created.namespace(), "Imported"),
            Err(e) => {
                warn!(name = %object.name(), error = %e, "Import failed");
                failed += 1;
            }
        }
    }

    println!("imported {} of {} instances", objects.len() - failed, objects.len());
    if failed > 0 {
        bail!("{} instances could not be imported", failed);
    }
    Ok(())
}
