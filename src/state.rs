use serde::{Deserialize, Serialize};

/// Coarse-grained stage of a project's processing pipeline. Advanced by
/// server-side background jobs; the client only observes it (see
/// `project::ProjectTracker` for the single optimistic exception).
///
/// Variant order is the pipeline order, so `Ord` compares progress.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Analyzing,
    CharactersReady,
    ScriptReady,
    Synthesizing,
    Completed,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Completed)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub state: LifecycleState,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Character {
    pub id: String,
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub age: String,
    #[serde(default)]
    pub description: String,
    /// Voice timbre/style prompt fed to generation.
    #[serde(default)]
    pub voice_prompt: String,
    /// Text spoken in the reference take.
    #[serde(default)]
    pub reference_text: String,
    /// Opaque reference to the current voice take, if any.
    #[serde(default)]
    pub reference_audio: Option<String>,
    #[serde(default)]
    pub is_voice_confirmed: bool,
    /// Duration of the reference take in seconds.
    #[serde(default)]
    pub duration: Option<f64>,
    /// Last preview failure, client-side only.
    #[serde(skip)]
    pub preview_error: Option<String>,
}

impl Character {
    /// Replaces the reference take. Any change invalidates a prior
    /// confirmation; confirmation only comes back through `confirm`.
    pub fn set_reference_audio(&mut self, audio: Option<String>) {
        if self.reference_audio != audio {
            self.reference_audio = audio;
            self.is_voice_confirmed = false;
        }
    }

    /// Confirms the current take. Returns false when there is nothing to
    /// confirm.
    pub fn confirm(&mut self) -> bool {
        if self.reference_audio.is_none() {
            return false;
        }
        self.is_voice_confirmed = true;
        true
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisState {
    Pending,
    Processing,
    Synthesized,
    Failed,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ScriptLine {
    pub id: String,
    pub project_id: String,
    #[serde(default)]
    pub character_id: Option<String>,
    #[serde(default)]
    pub text: String,
    pub status: SynthesisState,
    /// Opaque reference to the synthesized take. Present iff `status` is
    /// `Synthesized`.
    #[serde(default)]
    pub audio: Option<String>,
    /// Fractional sort key; inserting between neighbors takes the
    /// midpoint, so the rest of the sequence never renumbers.
    pub ordering_key: f64,
    #[serde(default = "default_speed")]
    pub speed: f64,
    /// Duration of the take in seconds.
    #[serde(default)]
    pub duration: Option<f64>,
}

fn default_speed() -> f64 {
    1.0
}

impl ScriptLine {
    pub fn mark_processing(&mut self) {
        self.status = SynthesisState::Processing;
        self.audio = None;
        self.duration = None;
    }

    pub fn mark_failed(&mut self) {
        self.status = SynthesisState::Failed;
        self.audio = None;
        self.duration = None;
    }

    pub fn mark_synthesized(&mut self, audio: String, duration: Option<f64>) {
        self.status = SynthesisState::Synthesized;
        self.audio = Some(audio);
        self.duration = duration;
    }
}

/// Midpoint ordering key for an insertion between `prev` and `next`.
pub fn ordering_key_between(prev: Option<f64>, next: Option<f64>) -> f64 {
    match (prev, next) {
        (Some(a), Some(b)) => (a + b) / 2.0,
        (Some(a), None) => a + 1.0,
        (None, Some(b)) => b - 1.0,
        (None, None) => 0.0,
    }
}

// --- Tasks ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }
}

/// One observation of a server-side job. Transient: lives only inside a
/// poll loop, never stored.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TaskSnapshot {
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}
