//! Conversation partners available for voice calls.

use serde::{Deserialize, Serialize};

/// Prebuilt voices offered by the live API.
pub const PREBUILT_VOICES: &[&str] = &["Puck", "Kore", "Charon", "Aoede", "Fenrir"];

/// Connect-time configuration for one simulated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub display_name: String,
    /// Behavioural instruction sent as the session's system instruction
    pub instruction: String,
    /// Prebuilt voice name
    pub voice: String,
}

impl Persona {
    pub fn new(id: &str, display_name: &str, instruction: &str, voice: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            instruction: instruction.to_string(),
            voice: voice.to_string(),
        }
    }

    pub fn has_prebuilt_voice(&self) -> bool {
        PREBUILT_VOICES.contains(&self.voice.as_str())
    }
}

pub fn default_personas() -> Vec<Persona> {
    vec![
        Persona::new(
            "tutor",
            "Emma (English tutor)",
            "You are Emma, a patient English tutor on a phone call with a language learner. \
             Speak slowly and clearly, keep answers short, gently correct mistakes by repeating \
             the sentence correctly, and introduce one useful new word at a time.",
            "Kore",
        ),
        Persona::new(
            "barista",
            "Leo (coffee shop)",
            "You are Leo, a friendly barista taking an order over the phone. Ask what the caller \
             would like, suggest drinks and sizes, and confirm the order. Use everyday vocabulary \
             and keep the conversation light.",
            "Puck",
        ),
        Persona::new(
            "travel-agent",
            "Sofia (travel agent)",
            "You are Sofia, a travel agent helping the caller plan a trip. Ask about dates, budget \
             and destination, describe options in simple terms, and check that the caller \
             understood key travel words.",
            "Aoede",
        ),
        Persona::new(
            "interviewer",
            "Mr. Grant (job interview)",
            "You are Mr. Grant, a polite but professional hiring manager running a practice job \
             interview. Ask one question at a time, follow up on the answers, and at the end give \
             brief feedback on the caller's language.",
            "Charon",
        ),
    ]
}

/// Look up a persona by id (case-insensitive).
pub fn find_persona<'a>(personas: &'a [Persona], id: &str) -> Option<&'a Persona> {
    let id = id.trim();
    personas.iter().find(|p| p.id.eq_ignore_ascii_case(id))
}
