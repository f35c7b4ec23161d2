use anyhow::Result;
use dubflow::api::HttpApi;
use dubflow::config::Config;
use dubflow::nav::{self, Screen};
use dubflow::session::Dashboard;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with valid server settings.");
            return Err(e);
        }
    };

    let api = Arc::new(HttpApi::new(&config.server.base_url)?);
    let dashboard = Dashboard::new(api);

    let projects = dashboard.refresh().await?;
    if projects.is_empty() {
        println!("No projects yet.");
        return Ok(());
    }

    for project in projects.iter() {
        let studio = if nav::can_enter(project.state, Screen::LineStudio) {
            "studio open"
        } else {
            "studio locked"
        };
        println!("{}  {:?}  {}  [{}]", project.id, project.state, project.name, studio);
    }

    Ok(())
}
