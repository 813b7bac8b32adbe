//! `list`, `get` and `delete` for registrations

use super::client::{ApiClient, collection_path};
use color_eyre::eyre::{Result, WrapErr};
use registrar_crd::{API_GROUP, ConditionStatus, ConditionType, Registration, VERSION};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct RegistrationList {
    #[serde(default)]
    items: Vec<Registration>,
}

fn registrations_path() -> String {
    collection_path(API_GROUP, VERSION, "registrations", None)
}

fn condition_cell(registration: &Registration, type_: ConditionType) -> &'static str {
    match registration.conditions().status(type_) {
        ConditionStatus::True => "True",
        ConditionStatus::False => "False",
        ConditionStatus::Unknown => "-",
    }
}

fn render_table(registrations: &[Registration]) -> String {
    let mut rows = vec![[
        "NAME".to_string(),
        "KIND".to_string(),
        "SCOPE".to_string(),
        "CONFLICT".to_string(),
        "TERMINATING".to_string(),
    ]];
    for r in registrations {
        rows.push([
            r.name().to_string(),
            r.spec.kind.clone(),
            if r.spec.cluster_scoped { "Cluster" } else { "Namespaced" }.to_string(),
            condition_cell(r, ConditionType::NameConflict).to_string(),
            condition_cell(r, ConditionType::Terminating).to_string(),
        ]);
    }

    let mut widths = [0usize; 5];
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    for row in &rows {
        let line = row
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = width))
            .collect::<Vec<_>>()
            .join("  ");
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

pub async fn list(client: &ApiClient) -> Result<()> {
    let list: RegistrationList = client.get(&registrations_path()).await?;
    if list.items.is_empty() {
        println!("No registrations found.");
        return Ok(());
    }
    print!("{}", render_table(&list.items));
    Ok(())
}

pub async fn get(client: &ApiClient, name: &str) -> Result<()> {
    let registration: Registration = client
        .get(&format!("{}/{}", registrations_path(), name))
        .await?;
    print!(
        "{}",
        serde_yaml::to_string(&registration).wrap_err("failed to render registration")?
    );
    Ok(())
}

/// Request deletion. The server drains instances in the background.
pub async fn delete(client: &ApiClient, name: &str) -> Result<()> {
    let registration: Registration = client
        .delete(&format!("{}/{}", registrations_path(), name))
        .await?;
    if registration.is_terminating() {
        println!("registration {} is terminating", registration.name());
    } else {
        println!("registration {} deleted", registration.name());
    }
    Ok(())
}
