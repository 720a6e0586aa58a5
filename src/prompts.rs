//! Prompt templates for relevance screening.
//!
//! Renders a screening prompt for one paper and assembles the chat message
//! sequence (system, few-shot pairs, paper prompt). Provider-agnostic.

use serde::{Deserialize, Serialize};

use crate::dataset::{Document, SlrInfo};
use crate::fewshot::FewShotExample;
use crate::gateway::Message;
use crate::screening::ScaleConfig;

// =============================================================================
// Prompt templates
// =============================================================================

/// A user-prompt template with `{placeholder}` slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub text: &'static str,
}

impl PromptTemplate {
    pub fn render(&self, document: &Document, slr: &SlrInfo, scale: ScaleConfig) -> String {
        self.text
            .replace("{title_paper}", &document.title)
            .replace("{abstract}", &document.abstract_text)
            .replace("{inclusion_criteria}", &slr.inclusion_criteria)
            .replace("{exclusion_criteria}", &slr.exclusion_criteria)
            .replace("{relevance_lower_value}", &scale.lower.to_string())
            .replace("{relevance_upper_value}", &scale.upper.to_string())
    }

    /// Content hash recorded in attempt traces.
    pub fn hash(&self) -> String {
        blake3::hash(self.text.as_bytes()).to_hex().to_string()
    }
}

/// A system-message template filled from SLR metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemTemplate {
    pub slug: &'static str,
    pub text: &'static str,
}

impl SystemTemplate {
    pub fn render(&self, slr: &SlrInfo) -> String {
        self.text
            .replace("{title}", &slr.title)
            .replace("{research_questions}", &slr.research_questions)
    }
}

/// How the model is asked to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromptingTechnique {
    #[serde(rename = "zero_shot")]
    ZeroShot,
    #[serde(rename = "CoT")]
    ChainOfThought,
    #[serde(rename = "few_shot")]
    FewShot,
}

impl PromptingTechnique {
    pub fn as_str(self) -> &'static str {
        match self {
            PromptingTechnique::ZeroShot => "zero_shot",
            PromptingTechnique::ChainOfThought => "CoT",
            PromptingTechnique::FewShot => "few_shot",
        }
    }

    /// Template for this technique on `scale`.
    pub fn template(self, scale: ScaleConfig) -> PromptTemplate {
        match self {
            PromptingTechnique::ChainOfThought => CHAIN_OF_THOUGHT,
            _ if scale.is_binary() => ZERO_SHOT_BINARY,
            _ => ZERO_SHOT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemMessageType {
    #[serde(rename = "system_message_rq")]
    WithResearchQuestions,
    #[serde(rename = "system_message_basic")]
    Basic,
}

impl SystemMessageType {
    pub fn template(self) -> SystemTemplate {
        match self {
            SystemMessageType::WithResearchQuestions => SYSTEM_WITH_RQ,
            SystemMessageType::Basic => SYSTEM_BASIC,
        }
    }
}

// =============================================================================
// Standard prompts
// =============================================================================

pub const ZERO_SHOT: PromptTemplate = PromptTemplate {
    slug: "zero_shot",
    text: r#"
Task:
You will be presented with a paper's title and abstract. Your task is to decide how relevant the given paper is to the review. Return a number for you decision ranging from '{relevance_lower_value}' to '{relevance_upper_value}', where '{relevance_lower_value}' means that you are absolutely sure that the paper should be excluded, where '{relevance_upper_value}' means that you are absolutely sure that the paper should be included, and where an intermediate value means that you are unsure. Please read the title and the abstract carefully and then make your decision based on the provided inclusion and exclusion criteria.

Title: '{title_paper}'
Abstract: '{abstract}'

Inclusion criteria: '{inclusion_criteria}'
Exclusion criteria: '{exclusion_criteria}'

Give your answer in the following format:
```
Decision: {relevance_lower_value} - {relevance_upper_value}
```
"#,
};

pub const ZERO_SHOT_BINARY: PromptTemplate = PromptTemplate {
    slug: "zero_shot_binary",
    text: r#"
Task:
You will be presented with a paper's title and abstract. Your task is to decide if the given paper is relevant to the review. Use the inclusion and exclusion criteria provided below to inform your decision. If any exclusion criteria are met or not all inclusion criteria are met, the paper should be excluded. If all inclusion criteria are met and no exclusion criterion is met, the paper should be included. Return '{relevance_lower_value}' if the paper should be excluded and '{relevance_upper_value}' if the paper should be included. Please read the title and the abstract carefully and then make your decision based on the provided criteria.

Title: '{title_paper}'
Abstract: '{abstract}'

Inclusion criteria: '{inclusion_criteria}'
Exclusion criteria: '{exclusion_criteria}'

Give your answer in the following format:
```
Decision: {relevance_lower_value} or {relevance_upper_value}
```
"#,
};

pub const CHAIN_OF_THOUGHT: PromptTemplate = PromptTemplate {
    slug: "CoT",
    text: r#"
Task:
You will be presented with a paper's title and abstract. Your task is to decide how relevant the given paper is to the review. Return a number for you decision ranging from '{relevance_lower_value}' to '{relevance_upper_value}', where '{relevance_lower_value}' means that you are absolutely sure that the paper should be excluded, where '{relevance_upper_value}' means that you are absolutely sure that the paper should be included, and where an intermediate value means that you are unsure. Please read the title and the abstract carefully and then make your decision based on the provided inclusion and exclusion criteria. Think step by step.

Title: '{title_paper}'
Abstract: '{abstract}'

Inclusion criteria: '{inclusion_criteria}'
Exclusion criteria: '{exclusion_criteria}'

Give your answer in the following format:
```
Explanation: "Let's think step by step..."
---
Decision: {relevance_lower_value} - {relevance_upper_value}
```

Explanation:
"#,
};

/// Marker a usable chain-of-thought exemplar must contain.
pub const COT_MARKER: &str = "Let's think step by step";

pub const SYSTEM_WITH_RQ: SystemTemplate = SystemTemplate {
    slug: "system_message_rq",
    text: "\nYou are a researcher conducting a systematic literature review (SLR) with the title '{title}'. The review aims to answer the following research questions: '{research_questions}'\nYour task is to decide how relevant the provided paper is to the review, given a list of criteria. A paper is relevant if all inclusion criteria but none of the exclusion criteria are met.\n",
};

pub const SYSTEM_BASIC: SystemTemplate = SystemTemplate {
    slug: "system_message_basic",
    text: "\nYou are a researcher conducting a systematic literature review (SLR) with the title '{title}'. Your task is to decide how relevant the provided paper is to the review, given a list of criteria. A paper is relevant if all inclusion criteria but none of the exclusion criteria are met.\n",
};

// =============================================================================
// Message assembly
// =============================================================================

/// Builds the message sequence for every document of one experiment.
#[derive(Debug, Clone)]
pub struct ScreeningPrompter {
    template: PromptTemplate,
    system_message: String,
    slr: SlrInfo,
    scale: ScaleConfig,
    /// Exemplars per repetition; empty for zero-shot runs.
    examples: Vec<Vec<FewShotExample>>,
}

impl ScreeningPrompter {
    pub fn new(
        template: PromptTemplate,
        system: SystemTemplate,
        slr: SlrInfo,
        scale: ScaleConfig,
    ) -> Self {
        Self {
            template,
            system_message: system.render(&slr),
            slr,
            scale,
            examples: Vec::new(),
        }
    }

    pub fn with_examples(mut self, examples: Vec<Vec<FewShotExample>>) -> Self {
        self.examples = examples;
        self
    }

    pub fn template(&self) -> PromptTemplate {
        self.template
    }

    pub fn system_message(&self) -> &str {
        &self.system_message
    }

    /// Exemplars shown in `repetition`.
    pub fn examples_for(&self, repetition: usize) -> &[FewShotExample] {
        self.examples
            .get(repetition)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn messages(&self, repetition: usize, document: &Document) -> Vec<Message> {
        let examples = self.examples_for(repetition);
        let mut messages = Vec::with_capacity(2 + 2 * examples.len());
        messages.push(Message::system(&self.system_message));
        for example in examples {
            messages.push(Message::user(&example.question));
            messages.push(Message::assistant(&example.response));
        }
        messages.push(Message::user(
            self.template.render(document, &self.slr, self.scale),
        ));
        messages
    }
}

// =============================================================================
// TESTS
// =============================================================================
