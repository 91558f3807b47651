//! Script-side names and call signatures.

/// Script-side name of a host method.
///
/// The first character is lower-cased and `snake_case` words are joined into
/// `lowerCamelCase`, so `Write`, `write` and `add_ints`/`AddInts` become
/// `write` and `addInts`.
pub fn script_name(host_name: &str) -> String {
    let mut name = String::with_capacity(host_name.len());
    let mut upper_next = false;
    for ch in host_name.chars() {
        if ch == '_' {
            // Leading underscores carry no word boundary.
            upper_next = !name.is_empty();
            continue;
        }
        if name.is_empty() {
            name.extend(ch.to_lowercase());
        } else if upper_next {
            name.extend(ch.to_uppercase());
        } else {
            name.push(ch);
        }
        upper_next = false;
    }
    name
}

/// Call signature for a method taking `arity` arguments: `name(_,_)`.
pub fn signature(name: &str, arity: usize) -> String {
    let mut signature = String::with_capacity(name.len() + 2 + arity * 2);
    signature.push_str(name);
    signature.push('(');
    for i in 0..arity {
        if i > 0 {
            signature.push(',');
        }
        signature.push('_');
    }
    signature.push(')');
    signature
}

/// Number of arguments a call handle for `signature` expects after the
/// receiver.
///
/// Placeholders count inside the trailing parameter list and inside a leading
/// subscript, so `[_,_]=(_)` takes three. Underscores in the name do not count.
pub fn call_arity(signature: &str) -> usize {
    let placeholders = |part: &str| part.bytes().filter(|&b| b == b'_').count();
    let mut arity = 0;
    if signature.ends_with(')')
        && let Some(open) = signature.rfind('(')
    {
        arity += placeholders(&signature[open..]);
    }
    if signature.starts_with('[')
        && let Some(close) = signature.find(']')
    {
        arity += placeholders(&signature[..close]);
    }
    arity
}
