pub mod mock_audio;
