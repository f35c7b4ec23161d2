use crate::state::{Character, Project, ScriptLine, TaskSnapshot};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

/// The narrow contract this client holds against the dubbing service:
/// plain request/response CRUD plus task-id handles for the three
/// generation jobs (character analysis, voice preview, synthesis).
/// Headers, auth and HTTP-level retries are not this layer's concern.
#[async_trait]
pub trait DubApi: Send + Sync {
    async fn create_project(&self, name: &str, content: &str) -> Result<Project>;
    async fn list_projects(&self) -> Result<Vec<Project>>;
    async fn get_project(&self, id: &str) -> Result<Project>;
    async fn delete_project(&self, id: &str) -> Result<()>;

    /// Kicks off server-side character analysis; the project's lifecycle
    /// advances out of band.
    async fn analyze_characters(&self, project_id: &str) -> Result<String>;

    async fn list_characters(&self, project_id: &str) -> Result<Vec<Character>>;
    async fn create_character(&self, spec: &NewCharacter) -> Result<Character>;
    async fn update_character(&self, id: &str, patch: &CharacterPatch) -> Result<()>;
    async fn delete_character(&self, id: &str) -> Result<()>;

    async fn preview_voice(&self, req: &PreviewRequest) -> Result<String>;

    async fn list_script_lines(&self, project_id: &str) -> Result<Vec<ScriptLine>>;
    async fn add_script_line(
        &self,
        project_id: &str,
        prev_line_id: Option<&str>,
    ) -> Result<ScriptLine>;
    async fn delete_script_line(&self, id: &str) -> Result<()>;

    async fn submit_synthesis(&self, req: &SynthesisRequest) -> Result<String>;

    async fn get_task_status(&self, task_id: &str) -> Result<TaskSnapshot>;
}

#[derive(Debug, Serialize, Clone)]
pub struct NewCharacter {
    pub project_id: String,
    pub name: String,
    pub gender: String,
    pub age: String,
    pub description: String,
    pub voice_prompt: String,
    pub reference_text: String,
}

#[derive(Debug, Serialize, Clone, Default)]
pub struct CharacterPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_voice_confirmed: Option<bool>,
}

#[derive(Debug, Serialize, Clone)]
pub struct PreviewRequest {
    pub character_id: String,
    pub text: String,
    pub prompt: String,
}

#[derive(Debug, Serialize, Clone)]
pub struct SynthesisRequest {
    pub project_id: String,
    pub line_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TaskRef {
    task_id: String,
}

#[derive(Serialize)]
struct CreateProjectBody<'a> {
    name: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct AddLineBody<'a> {
    prev_line_id: Option<&'a str>,
}

// --- HTTP implementation ---

pub struct HttpApi {
    base: Url,
    client: reqwest::Client,
}

impl HttpApi {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut normalized = base_url.to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        let base = Url::parse(&normalized)
            .with_context(|| format!("Invalid server base URL: {}", base_url))?;
        Ok(Self {
            base,
            client: reqwest::Client::new(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("Invalid endpoint path: {}", path))
    }

    async fn expect_ok(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(anyhow!("{} failed ({}): {}", what, status, body))
    }
}

#[async_trait]
impl DubApi for HttpApi {
    async fn create_project(&self, name: &str, content: &str) -> Result<Project> {
        let resp = self
            .client
            .post(self.endpoint("api/projects")?)
            .json(&CreateProjectBody { name, content })
            .send()
            .await
            .context("Failed to send create-project request")?;
        Ok(Self::expect_ok(resp, "create project").await?.json().await?)
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let resp = self
            .client
            .get(self.endpoint("api/projects")?)
            .send()
            .await
            .context("Failed to list projects")?;
        Ok(Self::expect_ok(resp, "list projects").await?.json().await?)
    }

    async fn get_project(&self, id: &str) -> Result<Project> {
        let resp = self
            .client
            .get(self.endpoint(&format!("api/projects/{}", id))?)
            .send()
            .await
            .context("Failed to fetch project")?;
        Ok(Self::expect_ok(resp, "get project").await?.json().await?)
    }

    async fn delete_project(&self, id: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.endpoint(&format!("api/projects/{}", id))?)
            .send()
            .await
            .context("Failed to delete project")?;
        Self::expect_ok(resp, "delete project").await?;
        Ok(())
    }

    async fn analyze_characters(&self, project_id: &str) -> Result<String> {
        let resp = self
            .client
            .post(self.endpoint(&format!("api/projects/{}/characters/analyze", project_id))?)
            .send()
            .await
            .context("Failed to submit character analysis")?;
        let task: TaskRef = Self::expect_ok(resp, "analyze characters")
            .await?
            .json()
            .await?;
        Ok(task.task_id)
    }

    async fn list_characters(&self, project_id: &str) -> Result<Vec<Character>> {
        let resp = self
            .client
            .get(self.endpoint(&format!("api/projects/{}/characters", project_id))?)
            .send()
            .await
            .context("Failed to list characters")?;
        Ok(Self::expect_ok(resp, "list characters")
            .await?
            .json()
            .await?)
    }

    async fn create_character(&self, spec: &NewCharacter) -> Result<Character> {
        let resp = self
            .client
            .post(self.endpoint(&format!("api/projects/{}/characters", spec.project_id))?)
            .json(spec)
            .send()
            .await
            .context("Failed to create character")?;
        Ok(Self::expect_ok(resp, "create character")
            .await?
            .json()
            .await?)
    }

    async fn update_character(&self, id: &str, patch: &CharacterPatch) -> Result<()> {
        let resp = self
            .client
            .patch(self.endpoint(&format!("api/characters/{}", id))?)
            .json(patch)
            .send()
            .await
            .context("Failed to update character")?;
        Self::expect_ok(resp, "update character").await?;
        Ok(())
    }

    async fn delete_character(&self, id: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.endpoint(&format!("api/characters/{}", id))?)
            .send()
            .await
            .context("Failed to delete character")?;
        Self::expect_ok(resp, "delete character").await?;
        Ok(())
    }

    async fn preview_voice(&self, req: &PreviewRequest) -> Result<String> {
        let resp = self
            .client
            .post(self.endpoint("api/voices/preview")?)
            .json(req)
            .send()
            .await
            .context("Failed to submit voice preview")?;
        let task: TaskRef = Self::expect_ok(resp, "preview voice").await?.json().await?;
        Ok(task.task_id)
    }

    async fn list_script_lines(&self, project_id: &str) -> Result<Vec<ScriptLine>> {
        let resp = self
            .client
            .get(self.endpoint(&format!("api/projects/{}/script", project_id))?)
            .send()
            .await
            .context("Failed to fetch script")?;
        Ok(Self::expect_ok(resp, "list script lines")
            .await?
            .json()
            .await?)
    }

    async fn add_script_line(
        &self,
        project_id: &str,
        prev_line_id: Option<&str>,
    ) -> Result<ScriptLine> {
        let resp = self
            .client
            .post(self.endpoint(&format!("api/projects/{}/script/lines", project_id))?)
            .json(&AddLineBody { prev_line_id })
            .send()
            .await
            .context("Failed to add script line")?;
        Ok(Self::expect_ok(resp, "add script line")
            .await?
            .json()
            .await?)
    }

    async fn delete_script_line(&self, id: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.endpoint(&format!("api/script/{}", id))?)
            .send()
            .await
            .context("Failed to delete script line")?;
        Self::expect_ok(resp, "delete script line").await?;
        Ok(())
    }

    async fn submit_synthesis(&self, req: &SynthesisRequest) -> Result<String> {
        let resp = self
            .client
            .post(self.endpoint("api/synthesis")?)
            .json(req)
            .send()
            .await
            .context("Failed to submit synthesis")?;
        let task: TaskRef = Self::expect_ok(resp, "submit synthesis")
            .await?
            .json()
            .await?;
        Ok(task.task_id)
    }

    async fn get_task_status(&self, task_id: &str) -> Result<TaskSnapshot> {
        let resp = self
            .client
            .get(self.endpoint(&format!("api/tasks/{}", task_id))?)
            .send()
            .await
            .context("Failed to query task status")?;
        Ok(Self::expect_ok(resp, "get task status")
            .await?
            .json()
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LifecycleState;

    #[test]
    fn test_base_url_gets_trailing_slash() -> Result<()> {
        let api = HttpApi::new("http://127.0.0.1:8000")?;
        assert_eq!(
            api.endpoint("api/tasks/t1")?.as_str(),
            "http://127.0.0.1:8000/api/tasks/t1"
        );
        Ok(())
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        assert!(HttpApi::new("not a url").is_err());
    }

    #[test]
    fn test_character_patch_serializes_only_set_fields() {
        let patch = CharacterPatch {
            name: Some("Narrator".to_string()),
            is_voice_confirmed: Some(true),
            ..Default::default()
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"name": "Narrator", "is_voice_confirmed": true})
        );
    }

    #[test]
    fn test_project_list_parses_wire_shape() {
        let projects: Vec<Project> = serde_json::from_str(
            r#"[{"id":"p1","name":"demo","state":"characters_ready","created_at":"2026-02-01T14:20:00"}]"#,
        )
        .unwrap();
        assert_eq!(projects[0].state, LifecycleState::CharactersReady);
    }

    #[test]
    fn test_task_ref_parses() {
        let t: TaskRef = serde_json::from_str(r#"{"task_id":"t42"}"#).unwrap();
        assert_eq!(t.task_id, "t42");
    }
}
