// ============================================================================
// spark-state - Macros
// ============================================================================

/// Clone handles into a `move` closure.
///
/// ```rust
/// use spark_state::{cloned, Runtime, Watchable};
///
/// let rt = Runtime::new();
/// let a = rt.state(1);
/// let b = rt.state(2);
///
/// let sum = cloned!(a, b => move || {
///     a.get_as::<i64>().unwrap_or(0) + b.get_as::<i64>().unwrap_or(0)
/// });
/// assert_eq!(sum(), 3);
/// a.set(5); // `a` is still usable here
/// ```
#[macro_export]
macro_rules! cloned {
    ($($n:ident),+ => $e:expr) => {
        {
            $( let $n = $n.clone(); )+
            $e
        }
    };
}

/// Build a computed from a list of dependencies and a body.
///
/// `computed!(rt, [a, b] => body)` clones `a` and `b` into the body and
/// registers both as dependencies.
///
/// ```rust
/// use spark_state::{computed, json, Runtime, Watchable};
///
/// let rt = Runtime::new();
/// let first = rt.state("Ada");
/// let last = rt.state("Lovelace");
///
/// let full = computed!(rt, [first, last] => format!(
///     "{} {}",
///     first.value().as_str().unwrap_or_default(),
///     last.value().as_str().unwrap_or_default(),
/// ));
/// assert_eq!(full.value(), json!("Ada Lovelace"));
///
/// first.set("Grace");
/// assert_eq!(full.value(), json!("Grace Lovelace"));
/// ```
#[macro_export]
macro_rules! computed {
    ($rt:expr, [$($deps:ident),+ $(,)?] => $body:expr) => {
        $rt.computed(
            $crate::cloned!($($deps),+ => move || $body),
            &[$(&$deps as &dyn $crate::Watchable),+],
        )
    };
}
