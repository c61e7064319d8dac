pub mod nodes;
pub mod quota;

#[cfg(test)]
pub(crate) mod test_support;
