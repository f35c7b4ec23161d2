use crate::api::{CharacterPatch, DubApi, NewCharacter, PreviewRequest, SynthesisRequest};
use crate::config::PollingConfig;
use crate::poller::{self, PollHandle, TaskOutcome};
use crate::project::{self, ProjectTracker, WatchHandle};
use crate::state::{ordering_key_between, Character, LifecycleState, Project, ScriptLine};
use crate::store::{EntityStore, Snapshot};
use anyhow::{anyhow, bail, Context, Result};
use futures_util::future::try_join;
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Client-side result of asking for a generation job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Submitted { task_id: String },
    /// The same character was submitted within the cooldown window.
    CoolingDown,
    /// The batch filter matched nothing; no request was made.
    NothingToDo,
}

/// Per-entity generation counters. A callback carries the token minted
/// at submission; if a newer submission bumped the counter since, the
/// callback is stale and gets discarded.
#[derive(Debug, Default)]
struct Generations(HashMap<String, u64>);

impl Generations {
    fn bump(&mut self, id: &str) -> u64 {
        let counter = self.0.entry(id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    fn is_current(&self, id: &str, token: u64) -> bool {
        self.0.get(id).copied().unwrap_or(0) == token
    }
}

fn sort_by_ordering_key(lines: &mut [ScriptLine]) {
    lines.sort_by(|a, b| a.ordering_key.total_cmp(&b.ordering_key));
}

fn audio_from_result(result: &Value) -> Option<String> {
    result
        .get("audio_url")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// One open project: the character and line stores, the lifecycle
/// tracker, and every generation workflow against them. Screens read
/// snapshots and dispatch intents; all mutation funnels through here.
pub struct ProjectSession {
    api: Arc<dyn DubApi>,
    polling: PollingConfig,
    tracker: Arc<Mutex<ProjectTracker>>,
    characters: Arc<Mutex<EntityStore<Character>>>,
    lines: Arc<Mutex<EntityStore<ScriptLine>>>,
    generations: Arc<Mutex<Generations>>,
    cooldowns: Mutex<HashMap<String, Instant>>,
    selected_line: Mutex<Option<String>>,
    pollers: Mutex<Vec<PollHandle>>,
}

impl std::fmt::Debug for ProjectSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectSession").finish_non_exhaustive()
    }
}

impl ProjectSession {
    pub fn open(api: Arc<dyn DubApi>, polling: PollingConfig, project: Project) -> Self {
        Self {
            api,
            polling,
            tracker: Arc::new(Mutex::new(ProjectTracker::new(project))),
            characters: Arc::new(Mutex::new(EntityStore::new())),
            lines: Arc::new(Mutex::new(EntityStore::new())),
            generations: Arc::new(Mutex::new(Generations::default())),
            cooldowns: Mutex::new(HashMap::new()),
            selected_line: Mutex::new(None),
            pollers: Mutex::new(Vec::new()),
        }
    }

    /// Create-flow: create the project, apply the single optimistic
    /// lifecycle write, then submit character analysis. If the analysis
    /// submission fails the optimistic write is rolled back and the
    /// error surfaces; the created project stays at `created`.
    pub async fn create(
        api: Arc<dyn DubApi>,
        polling: PollingConfig,
        name: &str,
        content: &str,
    ) -> Result<(Self, String)> {
        let project = api
            .create_project(name, content)
            .await
            .context("Failed to create project")?;
        info!("created project {} ({})", project.id, project.name);

        let session = Self::open(api, polling, project);
        session.tracker.lock().unwrap().force_analyzing();

        let project_id = session.project_id();
        match session.api.analyze_characters(&project_id).await {
            Ok(task_id) => {
                info!("character analysis {} submitted for {}", task_id, project_id);
                Ok((session, task_id))
            }
            Err(e) => {
                session.tracker.lock().unwrap().revert_analyzing();
                Err(e).context("Failed to submit character analysis")
            }
        }
    }

    pub fn project_id(&self) -> String {
        self.tracker.lock().unwrap().project().id.clone()
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.tracker.lock().unwrap().state()
    }

    pub fn tracker(&self) -> Arc<Mutex<ProjectTracker>> {
        self.tracker.clone()
    }

    pub fn characters(&self) -> Snapshot<Character> {
        self.characters.lock().unwrap().snapshot()
    }

    pub fn script(&self) -> Snapshot<ScriptLine> {
        self.lines.lock().unwrap().snapshot()
    }

    pub fn selected_line(&self) -> Option<String> {
        self.selected_line.lock().unwrap().clone()
    }

    pub fn select_line(&self, id: Option<&str>) {
        *self.selected_line.lock().unwrap() = id.map(str::to_string);
    }

    /// Parallel initial load of both collections; each authoritative
    /// list replaces its store, lines ordered by their sort key.
    pub async fn load(&self) -> Result<()> {
        let project_id = self.project_id();
        let (characters, mut lines) = try_join(
            self.api.list_characters(&project_id),
            self.api.list_script_lines(&project_id),
        )
        .await
        .context("Failed to load project data")?;

        sort_by_ordering_key(&mut lines);
        self.characters.lock().unwrap().replace_all(characters);
        self.lines.lock().unwrap().replace_all(lines);
        Ok(())
    }

    /// Spawns the lifecycle refresh loop for this project.
    pub fn start_watch(&self) -> WatchHandle {
        project::watch(
            self.api.clone(),
            self.tracker.clone(),
            self.polling.project_refresh(),
        )
    }

    fn track(&self, handle: PollHandle) {
        let mut pollers = self.pollers.lock().unwrap();
        pollers.retain(|h| !h.is_finished());
        pollers.push(handle);
    }

    pub fn active_pollers(&self) -> usize {
        let mut pollers = self.pollers.lock().unwrap();
        pollers.retain(|h| !h.is_finished());
        pollers.len()
    }

    /// Owning-component teardown: the only event that cancels this
    /// session's in-flight pollers. Navigation and selection changes
    /// never do.
    pub fn teardown(&self) {
        for handle in self.pollers.lock().unwrap().drain(..) {
            handle.cancel();
        }
    }

    // --- characters ---

    pub async fn add_character(&self, spec: NewCharacter) -> Result<Character> {
        let created = self
            .api
            .create_character(&spec)
            .await
            .context("Failed to create character")?;
        self.characters.lock().unwrap().upsert(created.clone());
        Ok(created)
    }

    /// Eager local edit; persists on the next `flush_character`.
    pub fn edit_character(&self, id: &str, patch: impl FnOnce(&mut Character)) -> Option<Character> {
        self.characters.lock().unwrap().update(id, patch)
    }

    /// Flushes the character's editable fields on an edit-session
    /// boundary.
    pub async fn flush_character(&self, id: &str) -> Result<()> {
        let character = self
            .characters
            .lock()
            .unwrap()
            .get(id)
            .ok_or_else(|| anyhow!("unknown character {}", id))?;
        let patch = CharacterPatch {
            name: Some(character.name),
            gender: Some(character.gender),
            age: Some(character.age),
            description: Some(character.description),
            voice_prompt: Some(character.voice_prompt),
            reference_text: Some(character.reference_text),
            is_voice_confirmed: None,
        };
        self.api
            .update_character(id, &patch)
            .await
            .context("Failed to flush character")
    }

    pub async fn delete_character(&self, id: &str) -> Result<()> {
        let Some((at, character)) = self.characters.lock().unwrap().remove(id) else {
            return Ok(());
        };
        if let Err(e) = self.api.delete_character(id).await {
            warn!("remote delete of character {} failed, restoring: {:#}", id, e);
            self.characters.lock().unwrap().insert_at(at, character);
            return Err(e).context("Failed to delete character");
        }
        Ok(())
    }

    // --- voice design ---

    /// Submits a voice-preview generation for the character. While the
    /// job is in flight the character shows no reference take at all
    /// (optimistic invalidation): a stale take must never look
    /// authoritative during regeneration. Re-submission within the
    /// cooldown window is refused client-side so overlapping jobs for
    /// one character cannot pile up.
    pub async fn preview_voice(&self, character_id: &str) -> Result<Dispatch> {
        let character = self
            .characters
            .lock()
            .unwrap()
            .get(character_id)
            .ok_or_else(|| anyhow!("unknown character {}", character_id))?;

        {
            let cooldowns = self.cooldowns.lock().unwrap();
            if let Some(last) = cooldowns.get(character_id) {
                if last.elapsed() < self.polling.preview_cooldown() {
                    info!("preview for {} refused: still cooling down", character_id);
                    return Ok(Dispatch::CoolingDown);
                }
            }
        }

        let req = PreviewRequest {
            character_id: character_id.to_string(),
            text: character.reference_text.clone(),
            prompt: character.voice_prompt.clone(),
        };
        // Submission failure surfaces here with nothing committed yet.
        let task_id = self
            .api
            .preview_voice(&req)
            .await
            .context("Failed to submit voice preview")?;

        self.cooldowns
            .lock()
            .unwrap()
            .insert(character_id.to_string(), Instant::now());
        let token = self.generations.lock().unwrap().bump(character_id);
        self.characters.lock().unwrap().update(character_id, |c| {
            c.set_reference_audio(None);
            c.preview_error = None;
        });

        let characters = self.characters.clone();
        let generations = self.generations.clone();
        let id = character_id.to_string();
        let handle = poller::start(
            self.api.clone(),
            task_id.clone(),
            self.polling.task_interval(),
            {
                let characters = characters.clone();
                let generations = generations.clone();
                let id = id.clone();
                move |result| {
                    if !generations.lock().unwrap().is_current(&id, token) {
                        debug!("discarding superseded preview for {}", id);
                        return;
                    }
                    let audio = audio_from_result(&result);
                    let duration = result.get("duration").and_then(Value::as_f64);
                    characters.lock().unwrap().update(&id, |c| match audio {
                        Some(audio) => {
                            c.set_reference_audio(Some(audio));
                            c.duration = duration;
                        }
                        None => c.preview_error = Some("preview returned no audio".to_string()),
                    });
                }
            },
            move |err| {
                if !generations.lock().unwrap().is_current(&id, token) {
                    return;
                }
                characters
                    .lock()
                    .unwrap()
                    .update(&id, |c| c.preview_error = Some(err));
            },
        );
        self.track(handle);
        Ok(Dispatch::Submitted { task_id })
    }

    /// Confirms the character's current reference take. Returns false
    /// when there is no take to confirm. The flag flips locally first
    /// and rolls back if the flush fails.
    pub async fn confirm_voice(&self, character_id: &str) -> Result<bool> {
        let updated = self
            .characters
            .lock()
            .unwrap()
            .update(character_id, |c| {
                c.confirm();
            })
            .ok_or_else(|| anyhow!("unknown character {}", character_id))?;
        if !updated.is_voice_confirmed {
            return Ok(false);
        }

        let patch = CharacterPatch {
            is_voice_confirmed: Some(true),
            ..Default::default()
        };
        if let Err(e) = self.api.update_character(character_id, &patch).await {
            self.characters
                .lock()
                .unwrap()
                .update(character_id, |c| c.is_voice_confirmed = false);
            return Err(e).context("Failed to confirm voice");
        }
        Ok(true)
    }

    // --- script lines ---

    pub fn edit_line_text(&self, id: &str, text: &str) -> Option<ScriptLine> {
        self.lines
            .lock()
            .unwrap()
            .update(id, |l| l.text = text.to_string())
    }

    pub fn set_line_speed(&self, id: &str, speed: f64) -> Option<ScriptLine> {
        self.lines.lock().unwrap().update(id, |l| l.speed = speed)
    }

    /// Assigns a speaker. The character must belong to this project.
    pub fn assign_character(&self, line_id: &str, character_id: &str) -> Result<()> {
        let character = self
            .characters
            .lock()
            .unwrap()
            .get(character_id)
            .ok_or_else(|| anyhow!("unknown character {}", character_id))?;
        if character.project_id != self.project_id() {
            bail!(
                "character {} belongs to project {}, not this one",
                character_id,
                character.project_id
            );
        }
        self.lines
            .lock()
            .unwrap()
            .update(line_id, |l| l.character_id = Some(character_id.to_string()))
            .ok_or_else(|| anyhow!("unknown line {}", line_id))?;
        Ok(())
    }

    /// Request/response insertion (not polled): the server returns the
    /// fully-formed line, which lands right after the anchor and becomes
    /// the active selection. The local sort key is the midpoint of its
    /// new neighbors, so the rest of the sequence keeps its keys; the
    /// next authoritative refresh replaces it.
    pub async fn add_line(&self, prev_line_id: Option<&str>) -> Result<ScriptLine> {
        let project_id = self.project_id();
        let mut line = self
            .api
            .add_script_line(&project_id, prev_line_id)
            .await
            .context("Failed to add script line")?;

        let (anchor_key, next_key) = {
            let snapshot = self.lines.lock().unwrap().snapshot();
            match prev_line_id.and_then(|a| snapshot.iter().position(|l| l.id == a)) {
                Some(i) => {
                    let next = if i + 1 < snapshot.len() {
                        Some(snapshot[i + 1].ordering_key)
                    } else {
                        None
                    };
                    (Some(snapshot[i].ordering_key), next)
                }
                None => (snapshot.last().map(|l| l.ordering_key), None),
            }
        };
        line.ordering_key = ordering_key_between(anchor_key, next_key);

        self.lines
            .lock()
            .unwrap()
            .insert_after(prev_line_id, line.clone());
        *self.selected_line.lock().unwrap() = Some(line.id.clone());
        Ok(line)
    }

    /// Optimistic-immediate removal; a failed remote delete restores the
    /// line at its former position.
    pub async fn delete_line(&self, id: &str) -> Result<()> {
        let Some((at, line)) = self.lines.lock().unwrap().remove(id) else {
            return Ok(());
        };
        {
            let mut selected = self.selected_line.lock().unwrap();
            if selected.as_deref() == Some(id) {
                *selected = None;
            }
        }
        if let Err(e) = self.api.delete_script_line(id).await {
            warn!("remote delete of line {} failed, restoring: {:#}", id, e);
            self.lines.lock().unwrap().insert_at(at, line);
            return Err(e).context("Failed to delete script line");
        }
        Ok(())
    }

    // --- synthesis ---

    pub async fn synthesize_line(&self, line_id: &str) -> Result<Dispatch> {
        let prev = self
            .lines
            .lock()
            .unwrap()
            .get(line_id)
            .ok_or_else(|| anyhow!("unknown line {}", line_id))?;

        let token = self.generations.lock().unwrap().bump(line_id);
        self.lines
            .lock()
            .unwrap()
            .update(line_id, ScriptLine::mark_processing);

        let req = SynthesisRequest {
            project_id: self.project_id(),
            line_ids: vec![line_id.to_string()],
        };
        let task_id = match self.api.submit_synthesis(&req).await {
            Ok(task_id) => task_id,
            Err(e) => {
                // The job never reached the server: restore, don't fail the line.
                let (status, audio, duration) = (prev.status, prev.audio, prev.duration);
                self.lines.lock().unwrap().update(line_id, |l| {
                    l.status = status;
                    l.audio = audio;
                    l.duration = duration;
                });
                return Err(e).context("Failed to submit synthesis");
            }
        };

        let lines = self.lines.clone();
        let generations = self.generations.clone();
        let id = line_id.to_string();
        let handle = poller::start(
            self.api.clone(),
            task_id.clone(),
            self.polling.task_interval(),
            {
                let lines = lines.clone();
                let generations = generations.clone();
                let id = id.clone();
                move |result| {
                    if !generations.lock().unwrap().is_current(&id, token) {
                        return;
                    }
                    let audio = audio_from_result(&result);
                    let duration = result.get("duration").and_then(Value::as_f64);
                    lines.lock().unwrap().update(&id, |l| match audio {
                        Some(audio) => l.mark_synthesized(audio, duration),
                        None => l.mark_failed(),
                    });
                }
            },
            move |_| {
                if !generations.lock().unwrap().is_current(&id, token) {
                    return;
                }
                lines.lock().unwrap().update(&id, ScriptLine::mark_failed);
            },
        );
        self.track(handle);
        Ok(Dispatch::Submitted { task_id })
    }

    /// Batch synthesis over every line the filter keeps. An empty target
    /// set never reaches the server. All targets flip to processing in
    /// one store update; the single task id is polled, and because it
    /// stands for many lines, success is reconciled by re-fetching the
    /// authoritative list instead of assuming uniform success.
    pub async fn synthesize_batch(
        &self,
        filter: impl Fn(&ScriptLine) -> bool,
    ) -> Result<Dispatch> {
        let prev = self.lines.lock().unwrap().snapshot();
        let targets: Vec<String> = prev
            .iter()
            .filter(|l| filter(l))
            .map(|l| l.id.clone())
            .collect();
        if targets.is_empty() {
            info!("batch synthesis requested but no line matched the filter");
            return Ok(Dispatch::NothingToDo);
        }

        let tokens: HashMap<String, u64> = {
            let mut generations = self.generations.lock().unwrap();
            targets
                .iter()
                .map(|id| (id.clone(), generations.bump(id)))
                .collect()
        };
        self.lines
            .lock()
            .unwrap()
            .update_many(&targets, ScriptLine::mark_processing);

        let req = SynthesisRequest {
            project_id: self.project_id(),
            line_ids: targets.clone(),
        };
        let task_id = match self.api.submit_synthesis(&req).await {
            Ok(task_id) => task_id,
            Err(e) => {
                let generations = self.generations.lock().unwrap();
                let mut lines = self.lines.lock().unwrap();
                for id in &targets {
                    if !generations.is_current(id, tokens[id]) {
                        continue;
                    }
                    if let Some(old) = prev.get(id) {
                        let (status, audio, duration) = (old.status, old.audio.clone(), old.duration);
                        lines.update(id, |l| {
                            l.status = status;
                            l.audio = audio;
                            l.duration = duration;
                        });
                    }
                }
                return Err(e).context("Failed to submit batch synthesis");
            }
        };
        info!("batch {} submitted covering {} lines", task_id, targets.len());

        let api = self.api.clone();
        let lines = self.lines.clone();
        let generations = self.generations.clone();
        let project_id = self.project_id();
        let interval = self.polling.task_interval();
        let task = task_id.clone();
        let handle = PollHandle::spawn(async move {
            match poller::run(api.as_ref(), &task, interval).await {
                TaskOutcome::Success(_) => match api.list_script_lines(&project_id).await {
                    Ok(mut fresh) => {
                        sort_by_ordering_key(&mut fresh);
                        lines.lock().unwrap().replace_all(fresh);
                    }
                    Err(e) => {
                        // Leaves the batch marks stale until the next load.
                        warn!("batch {} finished but the refresh failed: {:#}", task, e);
                    }
                },
                TaskOutcome::Failed(err) => {
                    warn!("batch {} failed: {}", task, err);
                    let still_current: Vec<String> = {
                        let generations = generations.lock().unwrap();
                        targets
                            .iter()
                            .filter(|id| generations.is_current(id, tokens[*id]))
                            .cloned()
                            .collect()
                    };
                    lines
                        .lock()
                        .unwrap()
                        .update_many(&still_current, ScriptLine::mark_failed);
                }
            }
        });
        self.track(handle);
        Ok(Dispatch::Submitted { task_id })
    }

    // --- project ---

    /// Deletes the open project. Local removal (including the cascade to
    /// both stores) happens in the same step as the remote call; a
    /// remote failure restores everything.
    pub async fn delete_project(&self) -> Result<()> {
        let project_id = self.project_id();
        let characters_prev = {
            let mut store = self.characters.lock().unwrap();
            let snapshot = store.snapshot();
            store.clear();
            snapshot
        };
        let lines_prev = {
            let mut store = self.lines.lock().unwrap();
            let snapshot = store.snapshot();
            store.clear();
            snapshot
        };

        if let Err(e) = self.api.delete_project(&project_id).await {
            warn!(
                "remote delete of project {} failed, restoring: {:#}",
                project_id, e
            );
            self.characters
                .lock()
                .unwrap()
                .replace_all(characters_prev.to_vec());
            self.lines.lock().unwrap().replace_all(lines_prev.to_vec());
            return Err(e).context("Failed to delete project");
        }
        info!("project {} deleted", project_id);
        Ok(())
    }
}

/// The project list screen: an `EntityStore` over projects with the
/// same optimistic-delete contract as the per-project stores.
pub struct Dashboard {
    api: Arc<dyn DubApi>,
    projects: Mutex<EntityStore<Project>>,
}

impl Dashboard {
    pub fn new(api: Arc<dyn DubApi>) -> Self {
        Self {
            api,
            projects: Mutex::new(EntityStore::new()),
        }
    }

    pub fn projects(&self) -> Snapshot<Project> {
        self.projects.lock().unwrap().snapshot()
    }

    pub async fn refresh(&self) -> Result<Snapshot<Project>> {
        let list = self
            .api
            .list_projects()
            .await
            .context("Failed to list projects")?;
        Ok(self.projects.lock().unwrap().replace_all(list))
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let Some((at, project)) = self.projects.lock().unwrap().remove(id) else {
            return Ok(());
        };
        if let Err(e) = self.api.delete_project(id).await {
            warn!("remote delete of project {} failed, restoring: {:#}", id, e);
            self.projects.lock().unwrap().insert_at(at, project);
            return Err(e).context("Failed to delete project");
        }
        Ok(())
    }
}
