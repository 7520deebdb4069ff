use diesel::table;

table! {
    relay_device_tokens (token) {
        token -> Text,
        user_id -> Text,
        device_id -> Nullable<Text>,
        platform -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}
