//! 答案重述：根据管理者 Transcript 让模型按严格短答案格式重新给出 FINAL ANSWER

use std::sync::Arc;

use crate::llm::{LlmClient, LlmError, Message, ModelReply, FINAL_ANSWER_TOOL};
use crate::react::Transcript;

const FORMAT_RULES: &str = "FINAL ANSWER FORMAT: Your response must strictly follow these formatting rules:
- For NUMBERS: Use digits only (not words), omit commas and units (no $, USD, %, etc.) unless specifically requested
- For TEXT: Omit articles and abbreviations unless specified, exclude final punctuation (.!?)
- For LISTS: Provide comma-separated values following the above number/text rules
- Follow ALL formatting instructions in the original question (alphabetization, sequencing, decimal places, etc.)
- Make sure the final output uses the specific units given in the question (/Angstrom, /thousand hours, etc.)
- If you cannot determine an answer, respond only with: \"Unable to determine\"
- Your entire response should consist of ONLY the requested information in the EXACT format specified - nothing more, nothing less.";

pub struct AnswerReformulator {
    llm: Arc<dyn LlmClient>,
}

impl AnswerReformulator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn build_messages(question: &str, transcript: &Transcript) -> Vec<Message> {
        let mut messages = vec![Message::system(format!(
            "Earlier you were asked the following:\n{question}\n\
             Your team then worked diligently to address that request. Read below a transcript of that conversation:"
        ))];
        // 整段对话以 user 身份呈现
        messages.extend(
            transcript
                .to_messages()
                .into_iter()
                .filter(|m| !m.content.trim().is_empty())
                .map(|m| Message::user(m.content)),
        );
        messages.push(Message::user(format!(
            "Read the above conversation and output a FINAL ANSWER to the question. \
             The question is repeated here for convenience:\n\n{question}\n\n{FORMAT_RULES}"
        )));
        messages
    }

    /// 返回重述后的答案（最后一个 `FINAL ANSWER: ` 之后的部分）
    pub async fn reformulate(&self, question: &str, transcript: &Transcript) -> Result<String, LlmError> {
        let reply = self.llm.complete(&Self::build_messages(question, transcript), &[]).await?;
        let text = match reply {
            ModelReply::Text(t) => t,
            ModelReply::ToolCall { name, arguments } if name == FINAL_ANSWER_TOOL => arguments
                .get("answer")
                .and_then(|a| a.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| arguments.to_string()),
            ModelReply::ToolCall { arguments, .. } => arguments.to_string(),
        };
        let answer = text.rsplit("FINAL ANSWER: ").next().unwrap_or(&text).trim().to_string();
        tracing::info!(answer = %answer, "reformulated answer");
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    #[tokio::test]
    async fn test_keeps_text_after_last_marker() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![ModelReply::text(
            "Looking at the notes... FINAL ANSWER: 12 FINAL ANSWER: 13 ",
        )]));
        let mut t = Transcript::with_prompt("How many?");
        t.push_final("thirteen").unwrap();
        let r = AnswerReformulator::new(llm.clone());
        assert_eq!(r.reformulate("How many?", &t).await.unwrap(), "13");

        let sent = llm.received(0).unwrap();
        assert_eq!(sent.len(), 4);
        assert!(sent[0].content.contains("Earlier you were asked the following:\nHow many?"));
        assert!(sent[3].content.contains("Unable to determine"));
    }

    #[tokio::test]
    async fn test_final_answer_tool_reply() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![ModelReply::final_answer("7")]));
        let t = Transcript::with_prompt("q");
        assert_eq!(AnswerReformulator::new(llm).reformulate("q", &t).await.unwrap(), "7");
    }
}
