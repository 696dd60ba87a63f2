/// Build a [`Document`](crate::Document) from `name => value` pairs. Values
/// go through `Value::from`, so plain literals work:
///
/// ```ignore
/// let d = doc! { "t" => date_from_millis(60_000), "m" => "a", "x" => 1i64 };
/// ```
#[macro_export]
macro_rules! doc {
    () => { $crate::Document::new() };
    ( $( $name:expr => $value:expr ),* $(,)? ) => {{
        let mut document = $crate::Document::new();
        $(
            document.append(
                $name.parse::<$crate::FieldName>().expect("invalid field name literal"),
                $crate::Value::from($value),
            );
        )*
        document
    }};
}

/// Build a [`Value::Array`](crate::Value) from values, each through
/// `Value::from`.
#[macro_export]
macro_rules! arr {
    ( $( $value:expr ),* $(,)? ) => {
        $crate::Value::Array(vec![ $( $crate::Value::from($value) ),* ])
    };
}
