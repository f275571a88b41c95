//! Name slugs for directory names.

/// Lowercases `name` and replaces every run of non-alphanumeric characters
/// with a single `-`, trimming dashes at both ends.
///
/// ```
/// use pipeflow::slug::slugify;
///
/// assert_eq!(slugify("Align Reads_v2"), "align-reads-v2");
/// ```
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;

    for c in name.chars() {
        if c.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
    }

    slug
}
