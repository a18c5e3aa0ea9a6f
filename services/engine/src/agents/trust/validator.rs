//! Condition Validator
//!
//! Offline syntactic/semantic checks for conditional-access expressions.
//! Needs no credentials and performs no lookups, so it doubles as a linter
//! for hand-written conditions.
//!
//! Checks run in order and stop at the first failure:
//! 1. expression is non-empty
//! 2. parentheses balance (string literals are skipped)
//! 3. comparisons use `==`, never a bare `=`
//! 4. the `repository` claim is compared somewhere
//! 5. `startsWith(...)` / `has(...)` calls take one plain, non-empty argument

use super::types::{ConditionError, ValidationRule};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    LParen,
    RParen,
    Dot,
    Op(&'static str),
    Other(char),
}

#[derive(Debug, Clone)]
struct Lexeme {
    token: Token,
    offset: usize,
}

const TWO_CHAR_OPS: [&str; 6] = ["==", "!=", "<=", ">=", "&&", "||"];

/// Validate an expression, returning the first rule it breaks
pub fn validate(expression: &str) -> Result<(), ConditionError> {
    if expression.trim().is_empty() {
        return Err(ConditionError::invalid(
            ValidationRule::NonEmpty,
            "expression is empty",
        ));
    }

    let lexemes = lex(expression)?;

    check_parentheses(&lexemes)?;
    check_double_equals(&lexemes)?;
    check_repository_claim(&lexemes)?;
    check_calls(&lexemes)?;

    Ok(())
}

fn lex(expression: &str) -> Result<Vec<Lexeme>, ConditionError> {
    let chars: Vec<char> = expression.chars().collect();
    let mut lexemes = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let offset = i;

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c == '\'' || c == '"' {
            let quote = c;
            let mut value = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => {
                        return Err(ConditionError::invalid(
                            ValidationRule::BalancedParentheses,
                            format!("unterminated string literal starting at offset {}", offset),
                        ))
                    }
                    Some('\\') => {
                        if let Some(escaped) = chars.get(i + 1) {
                            value.push(*escaped);
                        }
                        i += 2;
                    }
                    Some(ch) if *ch == quote => {
                        i += 1;
                        break;
                    }
                    Some(ch) => {
                        value.push(*ch);
                        i += 1;
                    }
                }
            }
            lexemes.push(Lexeme {
                token: Token::Str(value),
                offset,
            });
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            lexemes.push(Lexeme {
                token: Token::Ident(chars[start..i].iter().collect()),
                offset,
            });
            continue;
        }

        let token = match c {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '.' => Token::Dot,
            '=' | '!' | '<' | '>' | '&' | '|' => {
                let pair: String = chars[i..(i + 2).min(chars.len())].iter().collect();
                if let Some(op) = TWO_CHAR_OPS.iter().find(|op| **op == pair) {
                    i += 2;
                    lexemes.push(Lexeme {
                        token: Token::Op(*op),
                        offset,
                    });
                    continue;
                }
                match c {
                    '=' => Token::Op("="),
                    '!' => Token::Op("!"),
                    '<' => Token::Op("<"),
                    '>' => Token::Op(">"),
                    other => Token::Other(other),
                }
            }
            other => Token::Other(other),
        };
        i += 1;
        lexemes.push(Lexeme { token, offset });
    }

    Ok(lexemes)
}

fn check_parentheses(lexemes: &[Lexeme]) -> Result<(), ConditionError> {
    let mut open: Vec<usize> = Vec::new();
    for lexeme in lexemes {
        match lexeme.token {
            Token::LParen => open.push(lexeme.offset),
            Token::RParen => {
                if open.pop().is_none() {
                    return Err(ConditionError::invalid(
                        ValidationRule::BalancedParentheses,
                        format!("unmatched ')' at offset {}", lexeme.offset),
                    ));
                }
            }
            _ => {}
        }
    }

    match open.last() {
        Some(offset) => Err(ConditionError::invalid(
            ValidationRule::BalancedParentheses,
            format!("unclosed '(' at offset {}", offset),
        )),
        None => Ok(()),
    }
}

fn check_double_equals(lexemes: &[Lexeme]) -> Result<(), ConditionError> {
    match lexemes.iter().find(|l| l.token == Token::Op("=")) {
        Some(lexeme) => Err(ConditionError::invalid(
            ValidationRule::DoubleEquals,
            format!("bare '=' at offset {}; comparisons must use '=='", lexeme.offset),
        )),
        None => Ok(()),
    }
}

fn check_repository_claim(lexemes: &[Lexeme]) -> Result<(), ConditionError> {
    let compared = lexemes.iter().enumerate().any(|(i, lexeme)| {
        if !matches!(&lexeme.token, Token::Ident(name) if name == "repository") {
            return false;
        }
        let prev = i.checked_sub(1).and_then(|p| lexemes.get(p)).map(|l| &l.token);
        let next = lexemes.get(i + 1).map(|l| &l.token);
        let after_next = lexemes.get(i + 2).map(|l| &l.token);

        (matches!(prev, Some(Token::Op("=="))) && !matches!(next, Some(Token::Dot)))
            || matches!(next, Some(Token::Op("==")))
            || (matches!(next, Some(Token::Dot))
                && matches!(after_next, Some(Token::Ident(name)) if name == "startsWith"))
    });

    if compared {
        Ok(())
    } else {
        Err(ConditionError::invalid(
            ValidationRule::RepositoryClaim,
            "expression never compares the 'repository' claim",
        ))
    }
}

fn check_calls(lexemes: &[Lexeme]) -> Result<(), ConditionError> {
    for (i, lexeme) in lexemes.iter().enumerate() {
        let name = match &lexeme.token {
            Token::Ident(name) if name == "startsWith" || name == "has" => name.as_str(),
            _ => continue,
        };

        if name == "startsWith" {
            let is_method = i
                .checked_sub(1)
                .and_then(|p| lexemes.get(p))
                .is_some_and(|l| l.token == Token::Dot);
            if !is_method {
                return Err(ConditionError::invalid(
                    ValidationRule::WellFormedCalls,
                    format!(
                        "startsWith at offset {} must be called on a claim",
                        lexeme.offset
                    ),
                ));
            }
        }

        if lexemes.get(i + 1).map(|l| &l.token) != Some(&Token::LParen) {
            return Err(ConditionError::invalid(
                ValidationRule::WellFormedCalls,
                format!("{} at offset {} is missing '('", name, lexeme.offset),
            ));
        }

        // Parentheses are already balanced, so a matching ')' exists.
        let mut depth = 0usize;
        let mut close = lexemes.len();
        for (j, inner) in lexemes.iter().enumerate().skip(i + 1) {
            match inner.token {
                Token::LParen => depth += 1,
                Token::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        close = j;
                        break;
                    }
                }
                _ => {}
            }
        }

        let args = &lexemes[i + 2..close];
        if args
            .iter()
            .any(|l| matches!(l.token, Token::LParen | Token::RParen))
        {
            return Err(ConditionError::invalid(
                ValidationRule::WellFormedCalls,
                format!("{} at offset {} has a parenthesised argument", name, lexeme.offset),
            ));
        }
        let empty = match args {
            [] => true,
            [only] => matches!(&only.token, Token::Str(s) if s.is_empty()),
            _ => false,
        };
        if empty {
            return Err(ConditionError::invalid(
                ValidationRule::WellFormedCalls,
                format!("{} at offset {} has an empty argument", name, lexeme.offset),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_of(expression: &str) -> Option<ValidationRule> {
        validate(expression).err().and_then(|e| e.rule())
    }

    #[test]
    fn test_accepts_typical_conditions() {
        for expression in [
            "repository == 'acme/app'",
            "repository == 'acme/app' && ref == 'refs/heads/main' && has(actor)",
            "(repository == 'a/b' || repository == 'a/c') && ref.startsWith('refs/tags/v')",
            "'acme/app' == repository",
            "repository.startsWith('acme/') && job_workflow_ref.startsWith('acme/app/.github/workflows/')",
        ] {
            assert!(validate(expression).is_ok(), "rejected: {}", expression);
        }
    }

    #[test]
    fn test_rejects_empty() {
        assert_eq!(rule_of(""), Some(ValidationRule::NonEmpty));
        assert_eq!(rule_of("   \n"), Some(ValidationRule::NonEmpty));
    }

    #[test]
    fn test_rejects_unbalanced_parentheses() {
        assert_eq!(
            rule_of("(repository == 'acme/app'"),
            Some(ValidationRule::BalancedParentheses)
        );
        assert_eq!(
            rule_of("repository == 'acme/app')"),
            Some(ValidationRule::BalancedParentheses)
        );
        assert_eq!(
            rule_of("repository == 'acme/app"),
            Some(ValidationRule::BalancedParentheses)
        );
    }

    #[test]
    fn test_parentheses_inside_strings_are_ignored() {
        assert!(validate("repository == 'acme/app' && ref == 'refs/heads/(weird'").is_ok());
    }

    #[test]
    fn test_rejects_single_equals() {
        assert_eq!(
            rule_of("repository = 'owner/repo'"),
            Some(ValidationRule::DoubleEquals)
        );
        assert_eq!(
            rule_of("repository === 'owner/repo'"),
            Some(ValidationRule::DoubleEquals)
        );
    }

    #[test]
    fn test_equals_inside_string_literal_is_allowed() {
        assert!(validate("repository == 'acme/app' && ref == 'refs/heads/a=b'").is_ok());
    }

    #[test]
    fn test_rejects_missing_repository_claim() {
        assert_eq!(
            rule_of("ref=='refs/heads/main'"),
            Some(ValidationRule::RepositoryClaim)
        );
        assert_eq!(rule_of("has(repository)"), Some(ValidationRule::RepositoryClaim));
        assert_eq!(
            rule_of("ref == 'repository'"),
            Some(ValidationRule::RepositoryClaim)
        );
    }

    #[test]
    fn test_rejects_malformed_calls() {
        assert_eq!(
            rule_of("repository == 'a/b' && has()"),
            Some(ValidationRule::WellFormedCalls)
        );
        assert_eq!(
            rule_of("repository == 'a/b' && ref.startsWith('')"),
            Some(ValidationRule::WellFormedCalls)
        );
        assert_eq!(
            rule_of("repository == 'a/b' && ref.startsWith"),
            Some(ValidationRule::WellFormedCalls)
        );
        assert_eq!(
            rule_of("repository == 'a/b' && startsWith('refs/')"),
            Some(ValidationRule::WellFormedCalls)
        );
    }

    #[test]
    fn test_rejects_empty_or_parenthesised_arguments() {
        for expression in [
            "repository == 'a/b' && ref.startsWith()",
            "repository == 'a/b' && ref.startsWith(())",
            "repository == 'a/b' && ref.startsWith((''))",
            "repository == 'a/b' && ref.startsWith(('refs/heads/'))",
            "repository == 'a/b' && has((actor))",
        ] {
            assert_eq!(
                rule_of(expression),
                Some(ValidationRule::WellFormedCalls),
                "accepted: {}",
                expression
            );
        }
        let err = validate("repository == 'a/b' && ref.startsWith(())").unwrap_err();
        assert!(err.to_string().contains("parenthesised argument"));
    }

    #[test]
    fn test_checks_run_in_order() {
        // Both unbalanced and single-equals: parentheses are reported first.
        assert_eq!(
            rule_of("(ref = 'refs/heads/main'"),
            Some(ValidationRule::BalancedParentheses)
        );
        // Single-equals and no repository claim: single-equals first.
        assert_eq!(rule_of("ref = 'x'"), Some(ValidationRule::DoubleEquals));
    }
}
