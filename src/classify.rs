use crate::models::AnswerResponse;
use regex::Regex;
use std::sync::LazyLock;

/// An https URL: host with a dotted alphabetic final label, then an optional
/// path/query/fragment.
static COURSE_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://[a-zA-Z0-9.-]+\.[a-zA-Z]+(/[\w\-._~:/?#\[\]@!$&'()*+,;=]*)?$")
        .expect("course link pattern is valid")
});

pub fn is_course_link(text: &str) -> bool {
    COURSE_LINK.is_match(text)
}

/// Route a chain answer into either `answer` or `course_link`
pub fn classify_answer(text: &str) -> AnswerResponse {
    let text = text.trim();
    if is_course_link(text) {
        AnswerResponse {
            answer: None,
            course_link: Some(text.to_string()),
        }
    } else {
        AnswerResponse {
            answer: Some(text.to_string()),
            course_link: None,
        }
    }
}
