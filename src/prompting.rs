use minijinja::{context, Environment};

use crate::types::{Formality, Language, Persona, ResponseSpeed};

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.j2");

pub struct SystemPromptContext<'a> {
    pub agent_name: &'a str,
    pub persona: &'a Persona,
}

fn language_name(language: Language) -> &'static str {
    match language {
        Language::Pt => "Brazilian Portuguese",
        Language::En => "English",
        Language::Es => "Spanish",
    }
}

fn display_name(agent_name: &str) -> &str {
    if agent_name.trim().is_empty() {
        "Support Assistant"
    } else {
        agent_name.trim()
    }
}

pub fn render_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut env = Environment::new();
    if env
        .add_template("system_prompt", SYSTEM_PROMPT_TEMPLATE)
        .is_err()
    {
        return fallback_system_prompt(ctx);
    }

    let Ok(template) = env.get_template("system_prompt") else {
        return fallback_system_prompt(ctx);
    };

    let persona = ctx.persona;
    template
        .render(context! {
            agent_name => display_name(ctx.agent_name),
            language_name => language_name(persona.language),
            mood => persona.mood.as_str(),
            tone => persona.tone.as_str(),
            formality => persona.formality.as_str(),
            response_speed => persona.response_speed.as_str(),
            allow_emojis => persona.allow_emojis,
            opening_phrase => persona.opening_phrase.trim(),
            closing_phrase => persona.closing_phrase.trim(),
        })
        .unwrap_or_else(|_| fallback_system_prompt(ctx))
}

fn fallback_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let persona = ctx.persona;
    let mut prompt = format!(
        "You are {}, a customer support assistant.\n\
         Always answer in {}. Be accurate and never invent facts.\n",
        display_name(ctx.agent_name),
        language_name(persona.language),
    );
    if persona.formality == Formality::Formal {
        prompt.push_str("Address the customer formally.\n");
    }
    if persona.response_speed == ResponseSpeed::Fast {
        prompt.push_str("Answer in one or two short sentences.\n");
    }
    if !persona.allow_emojis {
        prompt.push_str("Never use emojis.\n");
    }
    prompt
}

/// Canned reply lines may reference `{{ agent_name }}`.
pub fn render_reply_line(line: &str, agent_name: &str) -> String {
    let env = Environment::new();
    env.render_str(line, context! { agent_name => display_name(agent_name) })
        .unwrap_or_else(|_| line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Language;

    #[test]
    fn system_prompt_carries_the_persona() {
        let persona = Persona {
            language: Language::En,
            allow_emojis: false,
            ..Persona::default()
        };
        let prompt = render_system_prompt(&SystemPromptContext {
            agent_name: "Nina",
            persona: &persona,
        });
        assert!(prompt.contains("You are Nina"));
        assert!(prompt.contains("Always answer in English."));
        assert!(prompt.contains("Never use emojis."));
        assert!(prompt.contains(persona.opening_phrase.trim()));
    }

    #[test]
    fn reply_lines_interpolate_the_agent_name() {
        assert_eq!(
            render_reply_line("Oi! Aqui é {{ agent_name }}.", "Nina"),
            "Oi! Aqui é Nina."
        );
        assert_eq!(render_reply_line("{{ broken", "Nina"), "{{ broken");
    }
}
