//! Prompt templates
//!
//! Placeholders are `{name}` and are filled literally by
//! [`fill_template`](crate::assembler::fill_template), so the JSON examples
//! below use single braces.

/// Recall-and-write: trivia answers woven into a short story
pub mod trivia {
    /// Switch system prompt
    pub const SWITCH_SYSTEM: &str = "You assign expert personas. For a topic, propose three \
different Researcher/Thinker pairs who will work on the same trivia-and-story task, plus one \
decider who judges their work. Reply with a JSON object only.";

    /// Switch user prompt
    pub const SWITCH_USER: &str = r#"Topic: {topic}
Questions:
{questions}

Return JSON only:
{"groups": [
  {"id": 1, "researcher": "...", "thinker": "..."},
  {"id": 2, "researcher": "...", "thinker": "..."},
  {"id": 3, "researcher": "...", "thinker": "..."}
 ],
 "decider": "..."}"#;

    /// One call answering for every researcher persona
    pub const MERGED_RESEARCHER: &str = r#"{count} questions about {topic}:
{questions}

Answer as each of these researchers, separately and in their own voice:
{personas}

Rules:
- each researcher answers every question, in question order
- one word or short phrase per answer
- researchers may legitimately disagree; do not copy each other
- write "unknown" when a researcher would not know

Return JSON only:
{schema}"#;

    /// One researcher answering alone
    pub const RESEARCHER: &str = r#"{count} questions about {topic}:
{questions}

Answer each question in order with one word or short phrase. Write "unknown" if unsure.
Return JSON only: {"answers": ["...", "..."]}"#;

    /// Thinker prompt; persona goes in the system message
    pub const THINKER: &str = r#"Topic: {topic}
{facts}
Propose a creative direction for a short story on this topic in at most ten words.
Return JSON only: {"creative_direction": "..."}"#;

    /// Arbitration prompt
    pub const MINIMUX: &str = r#"You judge a trivia-and-story task about "{topic}".

Questions:
{questions}

Coverage: {coverage}

Researcher answers:
{answers}

Creative directions:
{directions}

1. For each question pick the best answer. Prefer the answer most researchers agree on, but
   replace it when it does not actually answer the question. Never answer "unknown".
   Keep one word or short phrase per answer, in question order, exactly {count} answers.
2. Write one paragraph of about 80 words about "{topic}" that uses every final answer and
   blends the strongest creative directions.

Return JSON only:
{"final_answers": ["...", "..."], "final_story": "..."}"#;
}

/// Word-link: one clue covering a set of target words on a board
pub mod codenames {
    /// Switch system prompt
    pub const SWITCH_SYSTEM: &str = "You run a word-association game. Give a first spymaster \
clue, then three different Researcher/Thinker persona pairs and one decider. Reply with a JSON \
object only.";

    /// Switch user prompt
    pub const SWITCH_USER: &str = r#"Targets ({n}): {target_words}
Board: {word_list}

1. As spymaster, give ONE English clue word linking the targets. It must not be a board word.
2. Propose three persona groups (researcher + thinker).
3. Name one decider.

Return JSON only:
{"spymaster_clue": "word",
 "groups": [
  {"group_id": 1, "researcher": {"persona": "..."}, "thinker": {"persona": "..."}},
  {"group_id": 2, "researcher": {"persona": "..."}, "thinker": {"persona": "..."}},
  {"group_id": 3, "researcher": {"persona": "..."}, "thinker": {"persona": "..."}}
 ],
 "decider": {"persona": "..."}}"#;

    /// Researcher prompt
    pub const RESEARCHER: &str = r#"Targets: {target_words}
Board: {word_list}

List words and ideas associated with ALL targets at once, and note board words that could be
confused with them.
Return JSON only: {"associations": ["...", "..."]}"#;

    /// Thinker prompt
    pub const THINKER: &str = r#"Targets: {target_words}
Board: {word_list}
Spymaster's first idea: {spymaster_clue}
{facts}
Choose ONE clue word that points to every target and away from the other board words.
Return JSON only: {"clue": "word", "reasoning": "..."}"#;

    /// Arbitration prompt
    pub const MINIMUX: &str = r#"Pick the final clue for {n} target words.
Targets: {target_words}
Board: {word_list}
Spymaster's first idea: {spymaster_clue}

Coverage: {coverage}

Group research:
{answers}

Proposed clues:
{directions}

The clue must be one English word, not on the board, linking all targets.
Return JSON only: {"final_clue": "word", "reasoning": "..."}"#;

    /// Synthesis persona
    pub const GUESSER_SYSTEM: &str = "You are a Codenames guesser. You only ever name words that \
are on the board.";

    /// Synthesis prompt: turns the clue into board guesses
    pub const GUESSER: &str = r#"Clue: {final_clue}
Board: {word_list}

Pick exactly {n} board words the clue most likely points to, best first. Use board words only.
Return JSON only: {"guessed_words": ["...", "..."]}"#;
}

/// Constraint-puzzle: logic grid solving
pub mod logic {
    /// Switch system prompt
    pub const SWITCH_SYSTEM: &str = "You break logic grid puzzles into roles. Researchers \
extract constraints, thinkers deduce, a decider integrates. Reply with a JSON object only.";

    /// Switch user prompt
    pub const SWITCH_USER: &str = r#"Puzzle:
{inputs}

Propose three complementary persona groups:
- researcher: extracts constraints such as "left of" or "next to"
- thinker: deduces step by step
and one decider who integrates the findings.

Return JSON only, no markdown:
{"groups": [
  {"group_id": 1, "researcher": {"persona": "..."}, "thinker": {"persona": "..."}},
  {"group_id": 2, "researcher": {"persona": "..."}, "thinker": {"persona": "..."}},
  {"group_id": 3, "researcher": {"persona": "..."}, "thinker": {"persona": "..."}}
 ],
 "decider": {"persona": "..."}}"#;

    /// Researcher prompt
    pub const RESEARCHER: &str = r#"Puzzle:
{inputs}

List every constraint the puzzle states, one per entry, in plain words.
Return JSON only: {"constraints": ["...", "..."]}"#;

    /// Thinker prompt
    pub const THINKER: &str = r#"Puzzle:
{inputs}
{facts}
Solve the puzzle step by step and give the final answer the question asks for.
Return JSON only: {"answer": "...", "reasoning": "..."}"#;

    /// Arbitration prompt
    pub const MINIMUX: &str = r#"Puzzle:
{inputs}

Coverage: {coverage}

Extracted constraints:
{answers}

Candidate solutions:
{directions}

Check each candidate against every constraint, fix any violation, and give one final answer.
Return JSON only: {"final_answer": "...", "correction_log": "..."}"#;
}

/// Heading placed before researcher facts in thinker prompts
pub const FACTS_HEADING: &str = "Researcher notes:";
