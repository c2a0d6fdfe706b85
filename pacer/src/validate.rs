use lazy_regex::regex;

/// Longest name the execution engine accepts for a record.
pub const MAX_NAME_LENGTH: usize = 63;

pub fn arg(
    name: &str,
    arg: &str,
    validators: Vec<fn(&str) -> Result<(), String>>,
) -> Result<(), String> {
    for validator in validators {
        validator(arg).map_err(|e| format!("arg '{}' invalid; {}", name, e))?;
    }

    Ok(())
}

/// Names end up as record names and label values, so they follow the rules for both:
/// * 63 >= characters >= 1
/// * Only lowercase alphanumeric characters or hyphens
/// * Must start and end with an alphanumeric character
pub fn is_valid_name(name: &str) -> Result<(), String> {
    let lowercase_w_hyphens = regex!("^[a-z0-9]([-a-z0-9]*[a-z0-9])?$");

    if name.len() > MAX_NAME_LENGTH {
        return Err(format!("length cannot be greater than {MAX_NAME_LENGTH}"));
    }

    if !lowercase_w_hyphens.is_match(name) {
        return Err(
            "can only be made up of lowercase alphanumeric and hyphen characters and must start and end with \
             an alphanumeric character"
                .to_string(),
        );
    }

    Ok(())
}

pub fn not_empty_str(s: &str) -> Result<(), String> {
    if s.is_empty() {
        return Err("cannot be empty".to_string());
    }

    Ok(())
}
