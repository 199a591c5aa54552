/// Renders a scope claim template, substituting the LDAP mount accessor.
///
/// Templates use `{_accessor}` (or `{accessor}`) as the only placeholder,
/// with `{{` and `}}` standing for literal braces, so the JSON body
/// `{"groups": {{identity.entity.groups.names}}}` is written
/// `{{"groups": {{{{identity.entity.groups.names}}}}}}`.
///
/// # Errors
/// Returns a description of the first malformed or unknown placeholder.
pub fn render_claim_template(template: &str, accessor: &str) -> Result<String, String> {
    let mut out = String::with_capacity(template.len() + accessor.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => name.push(ch),
                        None => return Err("unterminated '{' placeholder".to_string()),
                    }
                }
                match name.trim() {
                    "_accessor" | "accessor" => out.push_str(accessor),
                    other => return Err(format!("unknown placeholder {{{other}}}")),
                }
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '}' => return Err("single '}' must be written as '}}'".to_string()),
            other => out.push(other),
        }
    }
    Ok(out)
}
