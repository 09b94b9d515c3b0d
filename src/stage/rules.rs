//! Phrase-list stage classifier.
//!
//! Only tenant-authored messages drive transitions:
//! - negative guard present → the message is skipped (menu/catalog boilerplate)
//! - hot hint present → `Hot`, scan stops
//! - engagement pattern present → `Engaged`, scan continues
//!
//! Matching is plain substring containment on normalized text.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::ConfigError;
use crate::stage::model::{Message, Stage};
use crate::stage::normalize::normalize;

const BUNDLED_PHRASES: &str = include_str!("../../config/phrases.json");

/// The three tunable phrase lists, as loaded from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhraseLists {
    /// Phrases announcing a handoff to a person or team.
    pub hot_hints: Vec<String>,
    /// Boilerplate that resembles a handoff but is not one.
    pub negative_guards: Vec<String>,
    /// Continuation confirmations and "what is your name" requests.
    pub engagement_patterns: Vec<String>,
}

impl PhraseLists {
    /// Read phrase lists from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw)
            .map_err(|e| ConfigError::ParseError(format!("phrase lists: {e}")))
    }

    /// The lists shipped with the crate.
    pub fn bundled() -> Result<Self, ConfigError> {
        Self::from_json(BUNDLED_PHRASES)
    }

    /// Empty lists; classifies everything as `New`.
    pub fn empty() -> Self {
        Self {
            hot_hints: Vec::new(),
            negative_guards: Vec::new(),
            engagement_patterns: Vec::new(),
        }
    }
}

impl Default for PhraseLists {
    /// The production lists bundled from `config/phrases.json`.
    fn default() -> Self {
        Self::bundled().unwrap_or_else(|e| {
            error!(error = %e, "Bundled phrase lists are unreadable, classifying everything as new");
            Self::empty()
        })
    }
}

/// Phrase lists normalized once and ready for matching.
#[derive(Debug, Clone)]
pub struct StageClassifier {
    hot_hints: Vec<String>,
    negative_guards: Vec<String>,
    engagement_patterns: Vec<String>,
}

impl StageClassifier {
    pub fn new(lists: &PhraseLists) -> Self {
        Self {
            hot_hints: prepare(&lists.hot_hints),
            negative_guards: prepare(&lists.negative_guards),
            engagement_patterns: prepare(&lists.engagement_patterns),
        }
    }

    /// Classifier over the production lists.
    pub fn default_rules() -> Self {
        Self::new(&PhraseLists::default())
    }

    /// Scan messages in the order given and derive a stage.
    pub fn classify(&self, messages: &[Message]) -> Stage {
        let mut stage = Stage::New;

        for (idx, message) in messages.iter().enumerate() {
            if !message.author_is_tenant {
                continue;
            }
            let text = normalize(message.text.as_deref());
            if text.is_empty() {
                continue;
            }

            if let Some(guard) = first_match(&text, &self.negative_guards) {
                debug!(index = idx, guard = %guard, "Message matched negative guard, skipping");
                continue;
            }

            if let Some(hint) = first_match(&text, &self.hot_hints) {
                debug!(index = idx, hint = %hint, "Message matched hot hint");
                return Stage::Hot;
            }

            if stage != Stage::Hot && first_match(&text, &self.engagement_patterns).is_some() {
                stage = Stage::Engaged;
            }
        }

        stage
    }
}

impl Default for StageClassifier {
    fn default() -> Self {
        Self::default_rules()
    }
}

/// Normalize, drop empties (an empty phrase matches everything) and dedupe.
fn prepare(phrases: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(phrases.len());
    for phrase in phrases {
        let p = normalize(Some(phrase));
        if !p.is_empty() && !out.contains(&p) {
            out.push(p);
        }
    }
    out
}

fn first_match<'a>(text: &str, phrases: &'a [String]) -> Option<&'a str> {
    phrases
        .iter()
        .find(|p| text.contains(p.as_str()))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(text: &str) -> Message {
        Message::new(true, text, 0)
    }

    fn customer(text: &str) -> Message {
        Message::new(false, text, 0)
    }

    #[test]
    fn handoff_after_name_request_is_hot() {
        let c = StageClassifier::default_rules();
        let msgs = vec![
            customer("oi"),
            tenant("qual seu nome?"),
            tenant("vou te passar para o setor comercial"),
        ];
        assert_eq!(c.classify(&msgs), Stage::Hot);
    }

    #[test]
    fn guard_suppresses_lookalike() {
        let c = StageClassifier::default_rules();
        let msgs = vec![tenant("veja nosso cardápio online")];
        assert_eq!(c.classify(&msgs), Stage::New);
    }

    #[test]
    fn guard_wins_over_hot_hint_in_same_message() {
        let c = StageClassifier::default_rules();
        let msgs = vec![tenant("vou encaminhar o cardápio para você")];
        assert_eq!(c.classify(&msgs), Stage::New);
    }

    #[test]
    fn guarded_message_skips_engagement_too() {
        let c = StageClassifier::default_rules();
        let msgs = vec![tenant("pode continuar, veja o menu")];
        assert_eq!(c.classify(&msgs), Stage::New);
    }

    #[test]
    fn customer_messages_never_drive_stage() {
        let c = StageClassifier::default_rules();
        let msgs = vec![
            customer("vou te passar para meu chefe"),
            customer("qual seu nome"),
        ];
        assert_eq!(c.classify(&msgs), Stage::New);
    }

    #[test]
    fn engagement_does_not_short_circuit() {
        let c = StageClassifier::default_rules();
        let msgs = vec![
            tenant("Qual o seu nome?"),
            customer("Maria"),
            tenant("Obrigado Maria, vou transferir você agora"),
        ];
        assert_eq!(c.classify(&msgs), Stage::Hot);
    }

    #[test]
    fn hot_short_circuits_later_messages() {
        let c = StageClassifier::default_rules();
        let msgs = vec![
            tenant("Estou transferindo seu atendimento"),
            tenant("veja o menu"),
            tenant("pode continuar"),
        ];
        assert_eq!(c.classify(&msgs), Stage::Hot);
    }

    #[test]
    fn engagement_alone_is_engaged() {
        let c = StageClassifier::default_rules();
        let msgs = vec![tenant("Sim, pode continuar")];
        assert_eq!(c.classify(&msgs), Stage::Engaged);
    }

    #[test]
    fn accents_and_case_are_ignored() {
        let c = StageClassifier::default_rules();
        let msgs = vec![tenant("EM BREVE VÃO ENTRAR EM CONTATO")];
        assert_eq!(c.classify(&msgs), Stage::Hot);
    }

    #[test]
    fn empty_and_missing_text_skipped() {
        let c = StageClassifier::default_rules();
        let msgs = vec![
            Message {
                author_is_tenant: true,
                text: None,
                timestamp: 1,
            },
            tenant("   "),
        ];
        assert_eq!(c.classify(&msgs), Stage::New);
        assert_eq!(c.classify(&[]), Stage::New);
    }

    #[test]
    fn empty_phrases_are_dropped() {
        let lists = PhraseLists {
            hot_hints: vec!["".into(), "   ".into()],
            negative_guards: vec![],
            engagement_patterns: vec!["\t".into()],
        };
        let c = StageClassifier::new(&lists);
        assert_eq!(c.classify(&[tenant("anything at all")]), Stage::New);
    }

    #[test]
    fn custom_lists_are_honoured() {
        let lists = PhraseLists {
            hot_hints: vec!["Hand You Off".into()],
            negative_guards: vec!["Brochure".into()],
            engagement_patterns: vec!["your name".into()],
        };
        let c = StageClassifier::new(&lists);
        assert_eq!(c.classify(&[tenant("What is your name?")]), Stage::Engaged);
        assert_eq!(c.classify(&[tenant("I will hand you off now")]), Stage::Hot);
        assert_eq!(
            c.classify(&[tenant("I will hand you off the brochure")]),
            Stage::New
        );
    }

    #[test]
    fn phrase_lists_parse_from_json() {
        let raw = r#"{"hot_hints":["a b"],"negative_guards":[],"engagement_patterns":["c"]}"#;
        let lists = PhraseLists::from_json(raw).unwrap();
        assert_eq!(lists.hot_hints, vec!["a b".to_string()]);
        assert!(PhraseLists::from_json("{not json").is_err());
    }

    #[test]
    fn bundled_lists_back_the_defaults() {
        let lists = PhraseLists::bundled().unwrap();
        assert_eq!(lists, PhraseLists::default());
        assert!(lists.hot_hints.iter().any(|p| p == "vou te passar para"));
        assert!(lists.negative_guards.iter().any(|p| p == "cardapio"));
        assert!(lists.engagement_patterns.iter().any(|p| p == "qual seu nome"));
    }

    #[test]
    fn empty_lists_classify_everything_new() {
        let c = StageClassifier::new(&PhraseLists::empty());
        assert_eq!(c.classify(&[tenant("vou te passar para o comercial")]), Stage::New);
    }
}
