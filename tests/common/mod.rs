//! Shared test support: an in-memory tract with a null token counter
//! and a scripted mock LLM client.

// Not every integration test binary uses every helper.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use tract::{
    ChatChoice, ChatRequest, ChatResponse, LlmClient, LlmError, Message, NullTokenCounter,
    TokenUsage, Tract,
};

/// LLM client that replays scripted responses (falling back to a default)
/// and records every request it receives.
pub struct MockLlm {
    responses: RefCell<VecDeque<String>>,
    default: String,
    pub requests: Rc<RefCell<Vec<ChatRequest>>>,
}

impl MockLlm {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            responses: RefCell::new(VecDeque::new()),
            default: default.into(),
            requests: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn push_response(&self, text: impl Into<String>) {
        self.responses.borrow_mut().push_back(text.into());
    }
}

impl LlmClient for MockLlm {
    fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        self.requests.borrow_mut().push(request);
        let content = self
            .responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());
        Ok(ChatResponse {
            choices: vec![ChatChoice {
                message: Message::new("assistant", content),
                reasoning: None,
                finish_reason: Some("stop".into()),
            }],
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
            model: Some("mock".into()),
        })
    }
}

/// In-memory tract with token counting disabled.
pub fn tract() -> Tract {
    let t = Tract::in_memory().expect("open in-memory tract");
    t.set_token_counter(Rc::new(NullTokenCounter));
    t
}

/// In-memory tract with a mock LLM whose every call answers `default`.
pub fn tract_with_llm(default: &str) -> Tract {
    let t = tract();
    t.set_llm_client(Box::new(MockLlm::new(default)));
    t
}
