pub fn task_extraction(transcript: &str) -> String {
    format!(
        "You turn meeting transcripts into action items.\n\
         Return ONLY a JSON array. Each element has: assignee (string or null), \
         description (string), due_date (YYYY-MM-DD or null), priority (1-10 or null), \
         effort_tag (\"small\", \"medium\", \"large\" or null), confidence (0.0-1.0), \
         is_blocked (boolean), blocker_reason (string or null).\n\n\
         Transcript:\n{transcript}"
    )
}

pub fn dependency_detection(transcript: &str) -> String {
    format!(
        "List ordering constraints between the work items discussed below.\n\
         Return ONLY a JSON object of the form \
         {{\"dependencies\": [{{\"from\": \"<task>\", \"depends_on\": \"<task>\"}}]}}.\n\n\
         Transcript:\n{transcript}"
    )
}

pub fn estimate_scoring(description: &str) -> String {
    format!(
        "Score this work item for prioritization.\n\
         Return ONLY a JSON object with reach (integer users affected), impact (1-10), \
         confidence (0.0-1.0) and effort (integer person-hours, at least 1).\n\n\
         Work item:\n{description}"
    )
}

pub fn assistant_action(message: &str, context: &str) -> String {
    format!(
        "You are Nova, a project assistant. Decide which single action answers the request.\n\
         Return ONLY a JSON object with action (string, \"none\" when no change is needed), \
         payload (object, optional), confidence (0.0-1.0, optional) and explanation (string).\n\n\
         Workspace context:\n{context}\n\nRequest:\n{message}"
    )
}

pub fn meeting_summary(transcript: &str) -> String {
    format!(
        "Summarize the meeting below in three sentences or fewer, naming owners and dates.\n\n\
         Transcript:\n{transcript}"
    )
}
