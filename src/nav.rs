use crate::state::LifecycleState;
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    /// Character editing + voice design. Open at any stage.
    CharacterWorkshop,
    /// Per-line dubbing. Needs the analysis result to exist.
    LineStudio,
}

/// Which screen families the project's current stage permits.
pub fn can_enter(state: LifecycleState, screen: Screen) -> bool {
    match screen {
        Screen::CharacterWorkshop => true,
        Screen::LineStudio => state >= LifecycleState::CharactersReady,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    Entered,
    /// Entry refused; the project is not far enough along. No navigation
    /// happened.
    NotReady { state: LifecycleState },
}

#[derive(Debug, Default)]
pub struct Navigator {
    current: Option<Screen>,
}

impl Navigator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Screen> {
        self.current
    }

    pub fn try_enter(&mut self, state: LifecycleState, screen: Screen) -> Entry {
        if can_enter(state, screen) {
            self.current = Some(screen);
            Entry::Entered
        } else {
            debug!("entry into {:?} refused at stage {:?}", screen, state);
            Entry::NotReady { state }
        }
    }
}
